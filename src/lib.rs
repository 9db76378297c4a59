//! Call session orchestration and signaling for full-mesh audio/video calls.
//!
//! A [`CallService`] runs one [`CallController`] per local user. The
//! controller detects incoming calls through the session store, drives the
//! per-call state machine, and lets the [`PeerLinkManager`] negotiate one
//! WebRTC connection per remote participant over a persisted signal log.

pub mod codec;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod logger;
pub mod media;
pub mod memory;
pub mod peer;
pub mod service;
pub mod session;
pub mod signaling;
pub mod subscription;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::CallConfig;
pub use controller::{CallController, CallDeps, CallSnapshot, CallState, ControllerEvent};
pub use directory::{CallDirectoryListener, DirectoryEvent};
pub use error::{
    CallError, CodecError, ConfigError, MediaAccessError, PeerError, SignalError,
    SignalingWriteError, StoreError,
};
pub use media::{CaptureDevice, LocalMediaState, LocalTrack, MediaSource, SampleFeed, TrackKind};
pub use memory::MemoryStore;
pub use peer::{PeerLinkManager, RemoteStream, RemoteStreams, RtcConnector};
pub use service::{CallClient, CallService};
pub use session::{
    CallSession, CallTarget, MediaKind, MembershipProvider, ScopeId, SessionChange,
    SessionFilter, SessionId, SessionStatus, SessionStore, UserId,
};
pub use signaling::{SignalBody, SignalKind, SignalMessage, SignalStore, SignalingChannel};
pub use subscription::Subscription;
