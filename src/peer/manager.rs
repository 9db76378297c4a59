//! Full-mesh link ownership and per-pair negotiation.

use crate::error::{PeerError, SignalError};
use crate::logger::dump_candidate;
use crate::media::LocalTrack;
use crate::peer::connection::{LinkEvent, LinkEventKind, LinkEventSink, PeerConnector, RemoteTrack};
use crate::peer::ice::{PendingCandidates, RemoteCandidate};
use crate::peer::link::{CandidateOutcome, PeerLink};
use crate::peer::types::{IceCandidate, LinkState, NegotiationRole, SessionDescription};
use crate::session::UserId;
use crate::signaling::{SignalBody, SignalMessage, SignalingChannel};
use crate::utils::random_id;
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Media received from one remote participant.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub remote_id: UserId,
    pub tracks: Vec<RemoteTrack>,
}

/// Push feed content: remote id to its stream.
pub type RemoteStreams = BTreeMap<UserId, RemoteStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// OFFER applied and ANSWER sent.
    Answered,
    /// ANSWER applied; `flushed` buffered candidates went to the transport.
    AnswerApplied { flushed: usize },
    Candidate(CandidateOutcome),
    /// CANDIDATE for a peer we have no link with yet.
    CandidateParked,
    /// Simultaneous offers; ours stands and theirs was dropped.
    GlareWon,
}

enum OfferPlan {
    Fresh,
    Glare,
    Renegotiate,
    Replace,
}

pub struct PeerLinkManager {
    local_id: UserId,
    connector: Arc<dyn PeerConnector>,
    payload_limit: u64,
    links: HashMap<UserId, PeerLink>,
    /// Candidates from peers we have no link with yet.
    parked: HashMap<UserId, PendingCandidates>,
    streams: RemoteStreams,
    streams_tx: watch::Sender<RemoteStreams>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl PeerLinkManager {
    pub fn new(local_id: UserId, connector: Arc<dyn PeerConnector>, payload_limit: u64) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (streams_tx, _) = watch::channel(RemoteStreams::new());
        Self {
            local_id,
            connector,
            payload_limit,
            links: HashMap::new(),
            parked: HashMap::new(),
            streams: RemoteStreams::new(),
            streams_tx,
            events_tx,
            events_rx,
        }
    }

    pub fn subscribe_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.streams_tx.subscribe()
    }

    pub fn link(&self, remote: &UserId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn linked_peers(&self) -> BTreeSet<UserId> {
        self.links.keys().cloned().collect()
    }

    pub fn streams(&self) -> &RemoteStreams {
        &self.streams
    }

    /// Next transport event from any link. Cancel safe.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.recv().await
    }

    /// Opens a link toward `remote`. As offerer, sends the OFFER.
    /// No-op when a link to `remote` already exists.
    pub async fn open(
        &mut self,
        remote: &UserId,
        role: NegotiationRole,
        tracks: &[LocalTrack],
        channel: &SignalingChannel,
    ) -> Result<(), SignalError> {
        if remote == &self.local_id {
            return Ok(());
        }
        if self.links.contains_key(remote) {
            debug!("Already linked to {remote}, not opening another link");
            return Ok(());
        }

        let link = self.create_link(remote, role, tracks).await?;
        let link_id = link.link_id().to_owned();
        info!("Opened link {link_id} to {remote} as {role:?}");

        if role == NegotiationRole::Offerer {
            let offer = match link.create_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    link.close().await;
                    return Err(e.into());
                }
            };
            self.links.insert(remote.clone(), link);
            channel.send(remote, &link_id, SignalBody::Offer(offer)).await?;
        } else {
            self.links.insert(remote.clone(), link);
        }
        Ok(())
    }

    async fn create_link(
        &mut self,
        remote: &UserId,
        role: NegotiationRole,
        tracks: &[LocalTrack],
    ) -> Result<PeerLink, PeerError> {
        let link_id = random_id();
        let sink = LinkEventSink::new(remote.clone(), link_id.clone(), self.events_tx.clone());
        let connection = self.connector.connect(sink).await?;
        for track in tracks {
            if let Err(e) = connection.add_track(track).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        let mut link = PeerLink::new(link_id, remote.clone(), role, connection);
        if let Some(parked) = self.parked.remove(remote) {
            debug!("Moving {} parked candidate(s) from {remote} into new link", parked.len());
            link.absorb_pending(parked);
        }
        Ok(link)
    }

    /// Applies one incoming signal. Errors are for logging; none is fatal.
    pub async fn handle_signal(
        &mut self,
        message: &SignalMessage,
        tracks: &[LocalTrack],
        channel: &SignalingChannel,
    ) -> Result<SignalOutcome, SignalError> {
        match message.decode(self.payload_limit)? {
            SignalBody::Offer(desc) => {
                self.on_offer(&message.from, &message.link_id, desc, tracks, channel)
                    .await
            }
            SignalBody::Answer(desc) => self.on_answer(&message.from, &message.link_id, desc).await,
            SignalBody::Candidate(candidate) => {
                Ok(self
                    .on_candidate(&message.from, &message.link_id, candidate)
                    .await)
            }
        }
    }

    async fn on_offer(
        &mut self,
        from: &UserId,
        remote_link: &str,
        desc: SessionDescription,
        tracks: &[LocalTrack],
        channel: &SignalingChannel,
    ) -> Result<SignalOutcome, SignalError> {
        let plan = match self.links.get(from) {
            None => OfferPlan::Fresh,
            Some(link) if link.awaiting_answer() => OfferPlan::Glare,
            Some(link) if link.remote_link_id() == Some(remote_link) => OfferPlan::Renegotiate,
            Some(_) => OfferPlan::Replace,
        };

        let mut carried = PendingCandidates::default();
        let mut retired = None;
        match plan {
            OfferPlan::Fresh => {}
            OfferPlan::Glare if self.local_id < *from => {
                info!("Offer glare with {from}: keeping our offer");
                return Ok(SignalOutcome::GlareWon);
            }
            OfferPlan::Glare => {
                info!("Offer glare with {from}: yielding to their offer");
                if let Some(mut link) = self.links.remove(from) {
                    carried = link.take_pending();
                    link.close().await;
                }
            }
            OfferPlan::Renegotiate => {
                if let Some(link) = self.links.get_mut(from) {
                    debug!("Renegotiating link {} with {from}", link.link_id());
                    link.set_remote_description(desc, remote_link).await?;
                    let answer = link.create_answer().await?;
                    let link_id = link.link_id().to_owned();
                    channel.send(from, &link_id, SignalBody::Answer(answer)).await?;
                }
                return Ok(SignalOutcome::Answered);
            }
            OfferPlan::Replace => {
                info!("{from} restarted its link ({remote_link}); replacing ours");
                if let Some(mut link) = self.links.remove(from) {
                    retired = link.remote_link_id().map(str::to_owned);
                    carried = link.take_pending();
                    link.close().await;
                }
                self.remove_stream(from);
            }
        }

        let mut link = self
            .create_link(from, NegotiationRole::Answerer, tracks)
            .await?;
        link.absorb_pending(carried);
        if let Some(previous) = retired {
            link.retire(previous);
        }

        let answer = match link.set_remote_description(desc, remote_link).await {
            Ok(flushed) => {
                trace!("Flushed {flushed} candidate(s) for {from}");
                link.create_answer().await
            }
            Err(e) => Err(e),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                link.close().await;
                return Err(e.into());
            }
        };

        let link_id = link.link_id().to_owned();
        info!("Answering {from} on link {link_id}");
        self.links.insert(from.clone(), link);
        channel.send(from, &link_id, SignalBody::Answer(answer)).await?;
        Ok(SignalOutcome::Answered)
    }

    async fn on_answer(
        &mut self,
        from: &UserId,
        remote_link: &str,
        desc: SessionDescription,
    ) -> Result<SignalOutcome, SignalError> {
        let link = self
            .links
            .get_mut(from)
            .ok_or_else(|| SignalError::Stale(format!("answer from {from} without a link")))?;
        if !link.awaiting_answer() {
            return Err(SignalError::Stale(format!(
                "answer from {from} but link {} is not waiting for one",
                link.link_id()
            )));
        }
        let flushed = link.set_remote_description(desc, remote_link).await?;
        debug!("Answer from {from} applied, {flushed} buffered candidate(s) flushed");
        Ok(SignalOutcome::AnswerApplied { flushed })
    }

    async fn on_candidate(
        &mut self,
        from: &UserId,
        remote_link: &str,
        candidate: IceCandidate,
    ) -> SignalOutcome {
        let candidate = RemoteCandidate {
            link_id: remote_link.to_owned(),
            candidate,
        };
        if let Some(link) = self.links.get_mut(from) {
            return SignalOutcome::Candidate(link.add_candidate(candidate).await);
        }
        if !candidate.candidate.is_well_formed() {
            return SignalOutcome::Candidate(CandidateOutcome::Rejected);
        }
        if self.parked.entry(from.clone()).or_default().push(candidate) {
            trace!("Parked candidate from {from} until a link exists");
            SignalOutcome::CandidateParked
        } else {
            SignalOutcome::Candidate(CandidateOutcome::Duplicate)
        }
    }

    /// Handles a transport event. Events from links that were replaced or
    /// closed are ignored.
    pub async fn on_link_event(&mut self, event: LinkEvent, channel: Option<&SignalingChannel>) {
        let current = self
            .links
            .get(&event.remote_id)
            .is_some_and(|link| link.link_id() == event.link_id);
        if !current {
            trace!(
                "Ignoring event from retired link {} of {}",
                event.link_id,
                event.remote_id
            );
            return;
        }

        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", event.remote_id.as_str(), &candidate);
                let Some(channel) = channel else {
                    return;
                };
                if let Err(e) = channel
                    .send(&event.remote_id, &event.link_id, SignalBody::Candidate(candidate))
                    .await
                {
                    warn!("Candidate for {} not delivered: {e}", event.remote_id);
                }
            }
            LinkEventKind::RemoteTrack(track) => {
                let stream = self
                    .streams
                    .entry(event.remote_id.clone())
                    .or_insert_with(|| RemoteStream {
                        remote_id: event.remote_id.clone(),
                        tracks: Vec::new(),
                    });
                if stream.tracks.iter().all(|t| t.id != track.id) {
                    stream.tracks.push(track);
                    self.publish_streams();
                }
            }
            LinkEventKind::StateChanged(LinkState::Failed) => {
                warn!("Link to {} failed; dropping it", event.remote_id);
                self.close_link(&event.remote_id).await;
            }
            LinkEventKind::StateChanged(state) => {
                debug!("Link to {} is {:?}", event.remote_id, state);
            }
        }
    }

    pub async fn close_link(&mut self, remote: &UserId) {
        if let Some(link) = self.links.remove(remote) {
            info!("Closing link {} to {remote}", link.link_id());
            link.close().await;
        }
        self.parked.remove(remote);
        self.remove_stream(remote);
    }

    /// Closes every link and forgets all remote media. Teardown only.
    pub async fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            link.close().await;
        }
        self.parked.clear();
        // late events from closed links
        while self.events_rx.try_recv().is_ok() {}
        if !self.streams.is_empty() {
            self.streams.clear();
            self.publish_streams();
        }
    }

    fn remove_stream(&mut self, remote: &UserId) {
        if self.streams.remove(remote).is_some() {
            self.publish_streams();
        }
    }

    fn publish_streams(&self) {
        self.streams_tx.send_replace(self.streams.clone());
    }
}
