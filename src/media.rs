//! Local capture: device acquisition and track-level mute/camera toggles.

use crate::error::MediaAccessError;
use crate::session::MediaKind;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Outgoing track. Clones share the enabled flag and the underlying RTP track.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = match kind {
            TrackKind::Audio => format!("audio-{}", random_id()),
            TrackKind::Video => format!("video-{}", random_id()),
        };
        Self {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc: Arc::new(TrackLocalStaticSample::new(
                capability,
                id,
                stream_id.to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Track handle for attaching to a peer connection.
    pub fn rtc(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Sends one encoded frame to every attached link. Dropped while the
    /// track is disabled; returns whether it was sent.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, webrtc::Error> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Permission boundary to the capture hardware.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Opens audio, plus video when `kind` asks for it.
    async fn open(&self, kind: MediaKind) -> Result<Vec<LocalTrack>, MediaAccessError>;

    /// Stops capture on tracks returned by `open`.
    async fn close(&self, _tracks: &[LocalTrack]) {}
}

/// Capture device fed by the embedding application through
/// [`LocalTrack::write_sample`]. Always grants access.
#[derive(Debug, Default, Clone)]
pub struct SampleFeed;

#[async_trait]
impl CaptureDevice for SampleFeed {
    async fn open(&self, kind: MediaKind) -> Result<Vec<LocalTrack>, MediaAccessError> {
        let stream_id = format!("local-{}", random_id());
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, &stream_id)];
        if kind.has_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }
        Ok(tracks)
    }
}

/// Active capture handle plus the mute/camera flags.
#[derive(Debug, Default)]
pub struct LocalMediaState {
    tracks: Vec<LocalTrack>,
    kind: Option<MediaKind>,
}

impl LocalMediaState {
    pub fn is_active(&self) -> bool {
        self.kind.is_some()
    }

    fn enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .any(LocalTrack::is_enabled)
    }

    pub fn audio_enabled(&self) -> bool {
        self.enabled(TrackKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.enabled(TrackKind::Video)
    }
}

pub struct MediaSource {
    device: Arc<dyn CaptureDevice>,
    state: LocalMediaState,
}

impl MediaSource {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: LocalMediaState::default(),
        }
    }

    /// Opens the capture device, or returns the tracks already open.
    pub async fn acquire(&mut self, kind: MediaKind) -> Result<&[LocalTrack], MediaAccessError> {
        if !self.state.is_active() {
            let tracks = self.device.open(kind).await?;
            if !tracks.iter().any(|t| t.kind() == TrackKind::Audio) {
                self.device.close(&tracks).await;
                return Err(MediaAccessError::Unavailable("no audio track".into()));
            }
            info!("Acquired {:?} capture with {} track(s)", kind, tracks.len());
            self.state = LocalMediaState {
                tracks,
                kind: Some(kind),
            };
        }
        Ok(&self.state.tracks)
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.state.tracks
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    /// Returns false when there is no audio track to toggle.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    /// Returns false when there is no video track to toggle.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Video, enabled)
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.state.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        if found {
            debug!("{kind:?} tracks enabled={enabled}");
        }
        found
    }

    /// Stops all tracks. No-op when nothing is held.
    pub async fn release(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let state = std::mem::take(&mut self.state);
        for track in &state.tracks {
            track.set_enabled(false);
        }
        self.device.close(&state.tracks).await;
        info!("Released local capture");
    }
}
