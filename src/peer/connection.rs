use crate::config::CallConfig;
use crate::error::PeerError;
use crate::logger::{analyze_candidates, dump_selected_pair};
use crate::media::{LocalTrack, TrackKind};
use crate::peer::types::{IceCandidate, LinkState, SessionDescription};
use crate::session::UserId;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::{
    configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
    RTCPeerConnection,
};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Media received from one remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// None for transports that do not carry real RTP (tests).
    pub rtc: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// Something happened on one peer link.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub remote_id: UserId,
    pub link_id: String,
    pub kind: LinkEventKind,
}

/// Tags transport callbacks with the link they belong to and forwards
/// them to the controller loop.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    remote_id: UserId,
    link_id: String,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub fn new(remote_id: UserId, link_id: String, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            remote_id,
            link_id,
            tx,
        }
    }

    pub fn remote_id(&self) -> &UserId {
        &self.remote_id
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    fn emit(&self, kind: LinkEventKind) {
        // the receiver is gone once the call service stopped
        let _ = self.tx.send(LinkEvent {
            remote_id: self.remote_id.clone(),
            link_id: self.link_id.clone(),
            kind,
        });
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(LinkEventKind::RemoteTrack(track));
    }

    pub fn state_changed(&self, state: LinkState) {
        self.emit(LinkEventKind::StateChanged(state));
    }
}

/// One bidirectional media connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections. Transport callbacks go to `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: LinkEventSink) -> Result<Box<dyn PeerConnection>, PeerError>;
}

/// [`PeerConnector`] backed by the `webrtc` crate.
pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
    grace_period: Duration,
}

impl RtcConnector {
    pub fn new(config: &CallConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config: rtc_config(config),
            grace_period: config.grace_period(),
        })
    }
}

fn rtc_config(config: &CallConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.rtc_ice_servers(),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: LinkEventSink) -> Result<Box<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::default();

        let sink = events.clone();
        let gathered_cb = gathered.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            let gathered = gathered_cb.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            gathered.lock().await.push(candidate.clone());
                            sink.local_candidate(candidate);
                        }
                        Err(e) => warn!("Dropping unserializable local candidate: {e}"),
                    },
                    None => {
                        let all = gathered.lock().await;
                        let (_, _, relay) = analyze_candidates(&all);
                        if relay == 0 {
                            debug!(
                                "No relay candidates for {}; connection through NAT may fail",
                                sink.remote_id()
                            );
                        }
                    }
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            info!("Remote {:?} track {} from {}", kind, track.id(), sink.remote_id());
            sink.remote_track(RemoteTrack {
                id: track.id(),
                kind,
                rtc: Some(track),
            });
            Box::pin(async {})
        }));

        let watchdog: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
        let sink = events.clone();
        let pc_state = Arc::downgrade(&pc);
        let grace_period = self.grace_period;
        let watchdog_cb = watchdog.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let sink = sink.clone();
            let pc_state = pc_state.clone();
            let watchdog = watchdog_cb.clone();
            Box::pin(async move {
                debug!("Link to {} state changed to: {:?}", sink.remote_id(), st);
                match st {
                    RTCPeerConnectionState::Connected => {
                        if let Some(handle) = watchdog.lock().await.take() {
                            debug!("Link to {} recovered during grace period", sink.remote_id());
                            handle.abort();
                        }
                        if let Some(pc) = pc_state.upgrade() {
                            dump_selected_pair(&pc, "CONNECTED").await;
                        }
                        sink.state_changed(LinkState::Connected);
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        sink.state_changed(LinkState::Disconnected);
                        let mut pending = watchdog.lock().await;
                        if pending.is_some() {
                            return;
                        }
                        if let Some(pc) = pc_state.upgrade() {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        }
                        let sink = sink.clone();
                        let pc_state = pc_state.clone();
                        *pending = Some(tokio::spawn(async move {
                            sleep(grace_period).await;
                            let recovered = pc_state
                                .upgrade()
                                .is_some_and(|pc| {
                                    pc.connection_state() == RTCPeerConnectionState::Connected
                                });
                            if !recovered {
                                warn!(
                                    "Link to {} did not recover within {:?}",
                                    sink.remote_id(),
                                    grace_period
                                );
                                sink.state_changed(LinkState::Failed);
                            }
                        }));
                    }
                    RTCPeerConnectionState::Closed => {
                        if let Some(handle) = watchdog.lock().await.take() {
                            handle.abort();
                        }
                        sink.state_changed(LinkState::Closed);
                    }
                    _ => sink.state_changed(LinkState::Connecting),
                }
            })
        }));

        Ok(Box::new(RtcPeerConnection { pc, watchdog }))
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RtcPeerConnection {
    async fn local_description(&self) -> Result<SessionDescription, PeerError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::InvalidDescription("local description not set".into()))?;
        SessionDescription::from_rtc(&desc)
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self.pc.add_track(track.rtc()).await?;
        // RTCP has to be drained for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}
