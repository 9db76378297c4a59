//! Call lifecycle state machine.
//!
//! One controller per local user. It owns the media source, the peer link
//! manager and every subscription of the current call, and is driven by a
//! single task: user commands and [`ControllerEvent`]s are handled one at a
//! time, so no two handlers ever touch the link map or the state at once.

use crate::config::CallConfig;
use crate::directory::{CallDirectoryListener, DirectoryEvent};
use crate::error::{CallError, SignalError, StoreError};
use crate::media::{CaptureDevice, MediaSource};
use crate::peer::{LinkEvent, NegotiationRole, PeerConnector, PeerLinkManager, RemoteStreams, SignalOutcome};
use crate::session::{
    CallSession, CallTarget, MediaKind, MembershipProvider, SessionChange, SessionFilter,
    SessionId, SessionStore, UserId,
};
use crate::signaling::{SignalMessage, SignalStore, SignalingChannel};
use crate::subscription::{next_or_pending, Subscription};
use crate::utils::random_id;
use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outbound, unanswered.
    Calling,
    /// Inbound, unanswered.
    Receiving,
    Connected,
    TearingDown,
}

/// What the UI layer renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub session: Option<CallSession>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub linked_peers: BTreeSet<UserId>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            session: None,
            audio_enabled: false,
            video_enabled: false,
            linked_peers: BTreeSet::new(),
        }
    }
}

/// External collaborators injected into the controller.
#[derive(Clone)]
pub struct CallDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub signals: Arc<dyn SignalStore>,
    pub membership: Arc<dyn MembershipProvider>,
    pub capture: Arc<dyn CaptureDevice>,
    pub connector: Arc<dyn PeerConnector>,
}

#[derive(Debug)]
pub enum ControllerEvent {
    /// None when the directory feed closed.
    Directory(Option<DirectoryEvent>),
    /// None when the session watch closed.
    Session(Option<SessionChange>),
    /// None when the signal feed closed.
    Signal(Option<SignalMessage>),
    Link(LinkEvent),
    RingTimeout,
}

pub struct CallController {
    local_id: UserId,
    sessions: Arc<dyn SessionStore>,
    signals: Arc<dyn SignalStore>,
    membership: Arc<dyn MembershipProvider>,
    config: CallConfig,
    state: CallState,
    session: Option<CallSession>,
    media: MediaSource,
    peers: PeerLinkManager,
    channel: Option<SignalingChannel>,
    directory: Option<CallDirectoryListener>,
    session_feed: Option<Subscription<SessionChange>>,
    signal_feed: Option<Subscription<SignalMessage>>,
    ring_deadline: Option<Instant>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallController {
    /// Starts listening for incoming calls.
    pub async fn start(
        local_id: UserId,
        deps: CallDeps,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        let directory = CallDirectoryListener::start(
            local_id.clone(),
            deps.sessions.as_ref(),
            deps.membership.as_ref(),
        )
        .await?;
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        info!("Call controller for {local_id} started");
        Ok(Self {
            peers: PeerLinkManager::new(
                local_id.clone(),
                deps.connector,
                config.max_payload_bytes,
            ),
            media: MediaSource::new(deps.capture),
            local_id,
            sessions: deps.sessions,
            signals: deps.signals,
            membership: deps.membership,
            config,
            state: CallState::Idle,
            session: None,
            channel: None,
            directory: Some(directory),
            session_feed: None,
            signal_feed: None,
            ring_deadline: None,
            snapshot_tx,
        })
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let media = self.media.state();
        CallSnapshot {
            state: self.state,
            session: self.session.clone(),
            audio_enabled: media.audio_enabled(),
            video_enabled: media.video_enabled(),
            linked_peers: self.peers.linked_peers(),
        }
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.peers.subscribe_streams()
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn require(&self, expected: CallState, op: &'static str) -> Result<(), CallError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    pub async fn start_call(
        &mut self,
        target: CallTarget,
        kind: MediaKind,
    ) -> Result<CallSession, CallError> {
        self.require(CallState::Idle, "start_call")?;

        let (scope_id, receiver_id) = match target {
            CallTarget::Group(scope) => (Some(scope), None),
            CallTarget::Direct(scope) => {
                let members = self.membership.members(&scope).await?;
                let other = members
                    .into_iter()
                    .find(|member| member != &self.local_id)
                    .ok_or(CallError::NoRecipient(scope))?;
                (None, Some(other))
            }
            CallTarget::User(user) => (None, Some(user)),
        };

        self.media.acquire(kind).await?;

        let session = CallSession::new(
            SessionId::new(random_id()),
            self.local_id.clone(),
            scope_id,
            receiver_id,
            kind,
        );
        if let Err(e) = self.sessions.create(&session).await {
            self.media.release().await;
            return Err(e.into());
        }

        info!("Calling: session {} ({:?})", session.id, kind);
        self.state = CallState::Calling;
        self.session = Some(session.clone());
        self.watch_session(&session.id).await;
        self.join_signaling(&session.id).await;
        self.ring_deadline = self.config.ring_timeout().map(|t| Instant::now() + t);
        self.publish();
        Ok(session)
    }

    pub async fn accept_call(&mut self) -> Result<CallSession, CallError> {
        self.require(CallState::Receiving, "accept_call")?;
        let Some(session) = self.session.clone() else {
            return Err(CallError::InvalidState {
                op: "accept_call",
                state: self.state,
            });
        };

        self.media.acquire(session.media_kind).await?;

        let record = match self
            .sessions
            .add_participant(&session.id, &self.local_id)
            .await
        {
            Ok(Some(record)) if record.is_active() => record,
            Ok(_) => {
                info!("Call {} ended before it was accepted", session.id);
                self.tear_down(false).await;
                return Err(CallError::SessionGone(session.id));
            }
            Err(e) => {
                self.media.release().await;
                return Err(e.into());
            }
        };

        info!(
            "Connected: joined {} with {} other participant(s)",
            record.id,
            record.participants.len() - 1
        );
        self.state = CallState::Connected;
        self.session = Some(record.clone());
        // changes queued while ringing predate our join
        self.session_feed = None;
        self.watch_session(&record.id).await;
        self.join_signaling(&record.id).await;

        if let Some(channel) = &self.channel {
            for remote in record.others(&self.local_id) {
                if let Err(e) = self
                    .peers
                    .open(remote, NegotiationRole::Offerer, self.media.tracks(), channel)
                    .await
                {
                    warn!("Could not open link to {remote}: {e}");
                }
            }
        }
        self.publish();
        Ok(record)
    }

    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        self.end_call("reject_call").await
    }

    pub async fn hang_up(&mut self) -> Result<(), CallError> {
        self.end_call("hang_up").await
    }

    async fn end_call(&mut self, op: &'static str) -> Result<(), CallError> {
        if matches!(self.state, CallState::Idle | CallState::TearingDown) {
            return Err(CallError::InvalidState {
                op,
                state: self.state,
            });
        }
        self.tear_down(true).await;
        Ok(())
    }

    /// Flips the microphone. Returns true when now muted.
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        if !self.media.state().is_active() {
            return Err(CallError::InvalidState {
                op: "toggle_mute",
                state: self.state,
            });
        }
        let enable = !self.media.state().audio_enabled();
        self.media.set_audio_enabled(enable);
        self.publish();
        Ok(!enable)
    }

    /// Flips the camera. Returns true when the camera is now on; always
    /// false for an audio-only call.
    pub fn toggle_camera(&mut self) -> Result<bool, CallError> {
        if !self.media.state().is_active() {
            return Err(CallError::InvalidState {
                op: "toggle_camera",
                state: self.state,
            });
        }
        let enable = !self.media.state().video_enabled();
        let toggled = self.media.set_video_enabled(enable);
        self.publish();
        Ok(toggled && enable)
    }

    /// Hangs up if needed and stops listening for incoming calls.
    pub async fn shutdown(&mut self) {
        if !matches!(self.state, CallState::Idle | CallState::TearingDown) {
            self.tear_down(true).await;
        }
        self.directory = None;
        info!("Call controller for {} stopped", self.local_id);
    }

    async fn watch_session(&mut self, id: &SessionId) {
        match self.sessions.subscribe(SessionFilter::Session(id.clone())).await {
            Ok(feed) => self.session_feed = Some(feed),
            Err(e) => warn!("Cannot watch session {id}: {e}"),
        }
    }

    async fn join_signaling(&mut self, id: &SessionId) {
        let channel = SignalingChannel::new(self.signals.clone(), id.clone(), self.local_id.clone());
        match channel.subscribe().await {
            Ok(feed) => self.signal_feed = Some(feed),
            Err(e) => warn!("Cannot subscribe to signals of {id}: {e}"),
        }
        self.channel = Some(channel);
    }

    /// Releases everything the call holds. With `leave`, the session record
    /// is updated too: the initiator (or either side of a direct call)
    /// deletes it, a joined participant removes itself. Store failures are
    /// logged, never returned.
    async fn tear_down(&mut self, leave: bool) {
        let joined = matches!(self.state, CallState::Calling | CallState::Connected);
        self.state = CallState::TearingDown;
        self.publish();

        self.signal_feed = None;
        self.session_feed = None;
        self.ring_deadline = None;
        self.peers.close_all().await;
        self.media.release().await;
        self.channel = None;

        if let Some(session) = self.session.take() {
            if leave {
                self.leave_record(&session, joined).await;
            }
            info!("Call {} over", session.id);
        }
        self.state = CallState::Idle;
        self.publish();
    }

    async fn leave_record(&self, session: &CallSession, joined: bool) {
        let id = &session.id;
        let result = if session.initiator_id == self.local_id || session.is_direct() {
            self.sessions.delete(id).await
        } else if joined {
            match self.sessions.remove_participant(id, &self.local_id).await {
                Ok(Some(record)) if record.participants.is_empty() => {
                    self.sessions.delete(id).await
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        match result {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!("Session {id} already gone"),
            Err(e) => warn!("Leaving session {id}: {e}"),
        }
    }

    /// Waits for the next thing to react to. Cancel safe.
    pub async fn next_event(&mut self) -> ControllerEvent {
        let ring = self.ring_deadline;
        tokio::select! {
            event = next_directory(&mut self.directory) => ControllerEvent::Directory(event),
            change = next_or_pending(&mut self.session_feed) => ControllerEvent::Session(change),
            message = next_or_pending(&mut self.signal_feed) => ControllerEvent::Signal(message),
            Some(event) = self.peers.next_event() => ControllerEvent::Link(event),
            _ = ring_elapsed(ring) => ControllerEvent::RingTimeout,
        }
    }

    pub async fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Directory(Some(event)) => self.on_directory(event).await,
            ControllerEvent::Directory(None) => {
                warn!("Directory feed closed; incoming calls will not be detected");
                self.directory = None;
            }
            ControllerEvent::Session(Some(change)) => self.on_session_change(change).await,
            ControllerEvent::Session(None) => {
                warn!("Session watch closed");
                self.session_feed = None;
            }
            ControllerEvent::Signal(Some(message)) => self.on_signal(message).await,
            ControllerEvent::Signal(None) => {
                warn!("Signal feed closed");
                self.signal_feed = None;
            }
            ControllerEvent::Link(event) => {
                self.peers.on_link_event(event, self.channel.as_ref()).await;
                self.publish();
            }
            ControllerEvent::RingTimeout => self.on_ring_timeout().await,
        }
    }

    async fn on_directory(&mut self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::Incoming(session) => {
                if self.state != CallState::Idle {
                    info!(
                        "Busy ({:?}); ignoring incoming call {}",
                        self.state, session.id
                    );
                    return;
                }
                info!("Receiving call {} from {}", session.id, session.initiator_id);
                self.state = CallState::Receiving;
                self.watch_session(&session.id).await;
                self.session = Some(session);
                self.publish();
            }
            DirectoryEvent::Ended(id) => {
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    info!("Call {id} ended by the caller");
                    self.tear_down(false).await;
                }
            }
        }
    }

    async fn on_session_change(&mut self, change: SessionChange) {
        let Some(previous) = self.session.clone() else {
            return;
        };
        if change.session().id != previous.id {
            return;
        }
        let record = match change {
            SessionChange::Removed(_) => {
                info!("Session {} removed remotely", previous.id);
                self.tear_down(false).await;
                return;
            }
            SessionChange::Added(record) | SessionChange::Modified(record) => record,
        };
        if !record.is_active() {
            info!("Session {} ended", record.id);
            self.tear_down(false).await;
            return;
        }
        let joined = matches!(self.state, CallState::Calling | CallState::Connected);
        if joined && !record.has_participant(&self.local_id) {
            info!("Removed from session {} by someone else", record.id);
            self.tear_down(false).await;
            return;
        }

        if self.state == CallState::Connected {
            for gone in previous.participants.difference(&record.participants) {
                if gone != &self.local_id {
                    self.peers.close_link(gone).await;
                }
            }
            if let Some(channel) = &self.channel {
                let newcomers: Vec<UserId> = record
                    .others(&self.local_id)
                    .filter(|remote| self.peers.link(remote).is_none())
                    .cloned()
                    .collect();
                for remote in newcomers {
                    debug!("{remote} joined; offering");
                    if let Err(e) = self
                        .peers
                        .open(&remote, NegotiationRole::Offerer, self.media.tracks(), channel)
                        .await
                    {
                        warn!("Could not open link to {remote}: {e}");
                    }
                }
            }
        }
        self.session = Some(record);
        self.publish();
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        let Some(channel) = self.channel.as_mut() else {
            trace!("No active session; dropping signal {}", message.id);
            return;
        };
        if !channel.admit(&message) {
            trace!("Dropping repeated or foreign signal {}", message.id);
            return;
        }

        match self
            .peers
            .handle_signal(&message, self.media.tracks(), channel)
            .await
        {
            Ok(outcome) => {
                trace!("{:?} from {}: {outcome:?}", message.kind, message.from);
                if outcome == SignalOutcome::Answered && self.state == CallState::Calling {
                    info!("Connected: {} answered our call", message.from);
                    self.state = CallState::Connected;
                    self.ring_deadline = None;
                }
            }
            Err(SignalError::Stale(reason)) => {
                debug!("Dropping {:?} from {}: {reason}", message.kind, message.from)
            }
            Err(e) => warn!("Dropping {:?} from {}: {e}", message.kind, message.from),
        }
        self.publish();
    }

    async fn on_ring_timeout(&mut self) {
        self.ring_deadline = None;
        let unanswered = self.state == CallState::Calling
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.others(&self.local_id).next().is_none());
        if unanswered {
            info!("No answer; hanging up");
            self.tear_down(true).await;
        }
    }
}

async fn next_directory(directory: &mut Option<CallDirectoryListener>) -> Option<DirectoryEvent> {
    match directory {
        Some(directory) => directory.next().await,
        None => std::future::pending().await,
    }
}

async fn ring_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaAccessError;
    use crate::memory::MemoryStore;
    use crate::session::ScopeId;
    use crate::signaling::SignalKind;
    use crate::testing::{FakeCapture, LoopbackConnector};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        store: MemoryStore,
        capture: Arc<FakeCapture>,
        controller: CallController,
    }

    async fn harness(store: &MemoryStore, user: &str, capture: FakeCapture) -> Harness {
        let capture = Arc::new(capture);
        let deps = CallDeps {
            sessions: Arc::new(store.clone()),
            signals: Arc::new(store.clone()),
            membership: Arc::new(store.clone()),
            capture: capture.clone(),
            connector: Arc::new(LoopbackConnector::new()),
        };
        let controller = CallController::start(UserId::from(user), deps, CallConfig::default())
            .await
            .unwrap();
        Harness {
            store: store.clone(),
            capture,
            controller,
        }
    }

    /// Handles events until nothing arrives for a short while.
    async fn settle(controller: &mut CallController) {
        while let Ok(event) = timeout(Duration::from_millis(30), controller.next_event()).await {
            controller.handle(event).await;
        }
    }

    #[tokio::test]
    async fn denied_capture_keeps_idle_and_creates_nothing() {
        let store = MemoryStore::new();
        let mut h = harness(&store, "alice", FakeCapture::denying()).await;
        let err = h
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Media(MediaAccessError::PermissionDenied)
        ));
        assert_eq!(h.controller.state(), CallState::Idle);
        assert_eq!(h.store.session_count(), 0);
    }

    #[tokio::test]
    async fn start_call_creates_record_and_rejects_second_start() {
        let store = MemoryStore::new();
        store.set_members("dm", ["alice", "bob"]);
        let mut h = harness(&store, "alice", FakeCapture::granting()).await;
        let session = h
            .controller
            .start_call(CallTarget::Direct(ScopeId::from("dm")), MediaKind::Video)
            .await
            .unwrap();
        assert_eq!(h.controller.state(), CallState::Calling);
        assert_eq!(session.receiver_id, Some(UserId::from("bob")));
        assert_eq!(session.scope_id, None);
        assert_eq!(
            session.participants,
            BTreeSet::from([UserId::from("alice")])
        );
        assert_eq!(h.store.session(&session.id), Some(session.clone()));

        let again = h
            .controller
            .start_call(CallTarget::User(UserId::from("carol")), MediaKind::Audio)
            .await;
        assert!(matches!(
            again,
            Err(CallError::InvalidState {
                state: CallState::Calling,
                ..
            })
        ));
        assert_eq!(h.capture.opens(), 1);
    }

    #[tokio::test]
    async fn direct_target_without_other_member() {
        let store = MemoryStore::new();
        store.set_members("solo", ["alice"]);
        let mut h = harness(&store, "alice", FakeCapture::granting()).await;
        let err = h
            .controller
            .start_call(CallTarget::Direct(ScopeId::from("solo")), MediaKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoRecipient(_)));
        assert_eq!(h.capture.opens(), 0);
    }

    #[tokio::test]
    async fn operations_need_the_right_state() {
        let store = MemoryStore::new();
        let mut h = harness(&store, "alice", FakeCapture::granting()).await;
        assert!(h.controller.accept_call().await.is_err());
        assert!(h.controller.hang_up().await.is_err());
        assert!(h.controller.reject_call().await.is_err());
        assert!(h.controller.toggle_mute().is_err());
        assert!(h.controller.toggle_camera().is_err());
    }

    #[tokio::test]
    async fn toggles_are_local_only() {
        let store = MemoryStore::new();
        let mut h = harness(&store, "alice", FakeCapture::granting()).await;
        let session = h
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        let mut snapshots = h.controller.subscribe_snapshot();

        assert!(h.controller.toggle_mute().unwrap());
        assert!(!snapshots.borrow_and_update().audio_enabled);
        assert!(!h.controller.toggle_mute().unwrap());
        assert!(h.controller.snapshot().audio_enabled);
        // audio-only call has no camera
        assert!(!h.controller.toggle_camera().unwrap());

        settle(&mut h.controller).await;
        assert!(h.store.signals(&session.id).is_empty());
    }

    #[tokio::test]
    async fn incoming_call_rings_and_caller_cancel_returns_to_idle() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        assert_eq!(bob.controller.state(), CallState::Receiving);
        assert_eq!(bob.controller.session().map(|s| &s.id), Some(&session.id));

        alice.controller.hang_up().await.unwrap();
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert_eq!(store.session_count(), 0);

        settle(&mut bob.controller).await;
        assert_eq!(bob.controller.state(), CallState::Idle);
        assert_eq!(bob.capture.opens(), 0);
    }

    #[tokio::test]
    async fn rejecting_a_direct_call_deletes_it() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        bob.controller.reject_call().await.unwrap();
        assert_eq!(store.session_count(), 0);

        settle(&mut alice.controller).await;
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert_eq!(alice.capture.closes(), 1);
    }

    #[tokio::test]
    async fn rejecting_a_group_call_leaves_it_running() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob", "carol"]);
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::Group(ScopeId::from("team")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        bob.controller.reject_call().await.unwrap();
        assert_eq!(bob.controller.state(), CallState::Idle);
        assert_eq!(store.session(&session.id), Some(session));

        settle(&mut alice.controller).await;
        assert_eq!(alice.controller.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn accepting_offers_to_everyone_in_the_record() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        let joined = bob.controller.accept_call().await.unwrap();
        assert_eq!(bob.controller.state(), CallState::Connected);
        assert!(joined.has_participant(&UserId::from("bob")));

        let offers: Vec<_> = store
            .signals(&session.id)
            .into_iter()
            .filter(|m| m.kind == SignalKind::Offer)
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].from, UserId::from("bob"));
        assert_eq!(offers[0].to, UserId::from("alice"));

        // a second accept is refused by the state check
        assert!(bob.controller.accept_call().await.is_err());
    }

    #[tokio::test]
    async fn accepting_a_vanished_call_reports_it() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        store.delete(&session.id).await.unwrap();

        let err = bob.controller.accept_call().await.unwrap_err();
        assert!(matches!(err, CallError::SessionGone(id) if id == session.id));
        assert_eq!(bob.controller.state(), CallState::Idle);
        assert_eq!(bob.capture.closes(), 1);
    }

    #[tokio::test]
    async fn ring_timeout_hangs_up_unanswered_call() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();
        assert!(alice.controller.ring_deadline.is_some());

        alice.controller.handle(ControllerEvent::RingTimeout).await;
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn signals_for_other_sessions_are_ignored() {
        let store = MemoryStore::new();
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        alice
            .controller
            .start_call(CallTarget::User(UserId::from("bob")), MediaKind::Audio)
            .await
            .unwrap();

        let foreign = SignalMessage::new(
            SessionId::from("elsewhere"),
            UserId::from("bob"),
            UserId::from("alice"),
            "b1",
            &crate::signaling::SignalBody::Offer(crate::peer::SessionDescription::offer("o")),
        )
        .unwrap();
        alice
            .controller
            .handle(ControllerEvent::Signal(Some(foreign)))
            .await;
        assert_eq!(alice.controller.state(), CallState::Calling);
        assert!(alice.controller.snapshot().linked_peers.is_empty());
    }
    #[tokio::test]
    async fn join_survives_changes_queued_while_ringing() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob", "carol"]);
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;
        let mut carol = harness(&store, "carol", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::Group(ScopeId::from("team")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        settle(&mut carol.controller).await;

        // bob's watch now holds carol's join, which does not list bob yet
        carol.controller.accept_call().await.unwrap();
        bob.controller.accept_call().await.unwrap();

        for _ in 0..3 {
            settle(&mut alice.controller).await;
            settle(&mut bob.controller).await;
            settle(&mut carol.controller).await;
        }
        assert_eq!(bob.controller.state(), CallState::Connected);
        assert_eq!(carol.controller.state(), CallState::Connected);
        assert_eq!(
            store.session(&session.id).unwrap().participants,
            BTreeSet::from([
                UserId::from("alice"),
                UserId::from("bob"),
                UserId::from("carol")
            ])
        );
        assert_eq!(
            bob.controller.snapshot().linked_peers,
            BTreeSet::from([UserId::from("alice"), UserId::from("carol")])
        );
    }

    #[tokio::test]
    async fn removal_by_someone_else_hangs_up_locally() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob"]);
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::Group(ScopeId::from("team")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        bob.controller.accept_call().await.unwrap();
        settle(&mut alice.controller).await;
        settle(&mut bob.controller).await;
        settle(&mut alice.controller).await;

        store
            .remove_participant(&session.id, &UserId::from("bob"))
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        assert_eq!(bob.controller.state(), CallState::Idle);
        assert_eq!(bob.capture.closes(), 1);
        // the record is left to the others
        assert_eq!(
            store.session(&session.id).unwrap().participants,
            BTreeSet::from([UserId::from("alice")])
        );

        settle(&mut alice.controller).await;
        assert_eq!(alice.controller.state(), CallState::Connected);
        assert!(alice.controller.snapshot().linked_peers.is_empty());
    }

    #[tokio::test]
    async fn last_participant_out_deletes_the_record() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob"]);
        let mut alice = harness(&store, "alice", FakeCapture::granting()).await;
        let mut bob = harness(&store, "bob", FakeCapture::granting()).await;

        let session = alice
            .controller
            .start_call(CallTarget::Group(ScopeId::from("team")), MediaKind::Audio)
            .await
            .unwrap();
        settle(&mut bob.controller).await;
        bob.controller.accept_call().await.unwrap();
        settle(&mut alice.controller).await;

        store
            .remove_participant(&session.id, &UserId::from("alice"))
            .await
            .unwrap();
        settle(&mut alice.controller).await;
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert_eq!(store.session_count(), 1);

        settle(&mut bob.controller).await;
        bob.controller.hang_up().await.unwrap();
        assert_eq!(bob.controller.state(), CallState::Idle);
        assert_eq!(store.session_count(), 0);
    }
}
