//! Deterministic stand-ins for the capture device and the peer transport.
//!
//! `LoopbackConnector` produces connections that never touch the network:
//! descriptions are plain strings, every local description trickles one
//! host candidate, and a link reports `Connected` plus one remote audio
//! track as soon as both descriptions are in place.

use crate::error::{MediaAccessError, PeerError};
use crate::media::{CaptureDevice, LocalTrack, TrackKind};
use crate::peer::connection::{LinkEventSink, PeerConnection, PeerConnector, RemoteTrack};
use crate::peer::types::{IceCandidate, LinkState, SdpKind, SessionDescription};
use crate::session::{MediaKind, UserId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Capture device that either always grants or always denies.
#[derive(Debug)]
pub struct FakeCapture {
    grant: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeCapture {
    pub fn granting() -> Self {
        Self {
            grant: true,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: false,
            ..Self::granting()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn open(&self, kind: MediaKind) -> Result<Vec<LocalTrack>, MediaAccessError> {
        if !self.grant {
            return Err(MediaAccessError::PermissionDenied);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, "fake")];
        if kind.has_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, "fake"));
        }
        Ok(tracks)
    }

    async fn close(&self, _tracks: &[LocalTrack]) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// What happened on one fake connection.
#[derive(Debug, Default, Clone)]
pub struct ConnectionRecord {
    pub tracks: Vec<String>,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

/// Handle on a connection created by [`LoopbackConnector`].
#[derive(Debug)]
pub struct FakeConnectionHandle {
    pub remote_id: UserId,
    pub link_id: String,
    record: Mutex<ConnectionRecord>,
}

impl FakeConnectionHandle {
    pub fn record(&self) -> ConnectionRecord {
        lock(&self.record).clone()
    }
}

#[derive(Debug, Default)]
pub struct LoopbackConnector {
    connections: Mutex<Vec<Arc<FakeConnectionHandle>>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnectionHandle>> {
        lock(&self.connections).clone()
    }

    pub fn connections_to(&self, remote: &UserId) -> Vec<Arc<FakeConnectionHandle>> {
        lock(&self.connections)
            .iter()
            .filter(|c| &c.remote_id == remote)
            .cloned()
            .collect()
    }

    /// Connections that were never closed.
    pub fn open_connections(&self) -> Vec<Arc<FakeConnectionHandle>> {
        lock(&self.connections)
            .iter()
            .filter(|c| !c.record().closed)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self, events: LinkEventSink) -> Result<Box<dyn PeerConnection>, PeerError> {
        let handle = Arc::new(FakeConnectionHandle {
            remote_id: events.remote_id().clone(),
            link_id: events.link_id().to_owned(),
            record: Mutex::new(ConnectionRecord::default()),
        });
        lock(&self.connections).push(handle.clone());
        Ok(Box::new(FakeConnection { handle, events }))
    }
}

struct FakeConnection {
    handle: Arc<FakeConnectionHandle>,
    events: LinkEventSink,
}

impl FakeConnection {
    fn local(&self, kind: SdpKind) -> Result<SessionDescription, PeerError> {
        let desc = {
            let mut record = lock(&self.handle.record);
            if record.closed {
                return Err(PeerError::Closed);
            }
            if kind == SdpKind::Answer && record.remote_descriptions.is_empty() {
                return Err(PeerError::InvalidDescription("answer without offer".into()));
            }
            let n = record.local_descriptions.len();
            let desc = SessionDescription {
                kind,
                sdp: format!("fake {:?} link={} n={n}", kind, self.handle.link_id),
            };
            record.local_descriptions.push(desc.clone());
            desc
        };
        self.events.local_candidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.handle.link_id,
                40000 + desc.sdp.len()
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        self.maybe_connected();
        Ok(desc)
    }

    fn maybe_connected(&self) {
        let record = lock(&self.handle.record);
        if record.local_descriptions.len() == 1 && record.remote_descriptions.len() == 1 {
            drop(record);
            self.events.state_changed(LinkState::Connected);
            self.events.remote_track(RemoteTrack {
                id: format!("audio-{}", self.handle.link_id),
                kind: TrackKind::Audio,
                rtc: None,
            });
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        lock(&self.handle.record).tracks.push(track.id().to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.local(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.local(SdpKind::Answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if desc.sdp.starts_with("bad") {
            return Err(PeerError::InvalidDescription(desc.sdp));
        }
        {
            let mut record = lock(&self.handle.record);
            if record.closed {
                return Err(PeerError::Closed);
            }
            record.remote_descriptions.push(desc);
        }
        self.maybe_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if candidate.candidate.contains("invalid") {
            return Err(PeerError::InvalidDescription(candidate.candidate));
        }
        lock(&self.handle.record).candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        lock(&self.handle.record).closed = true;
        self.events.state_changed(LinkState::Closed);
        Ok(())
    }
}
