//! Error types for the call core.
//!
//! Only [`CallError`] crosses the public API. Everything raised while
//! handling signaling traffic is logged and dropped by the controller.

use crate::controller::CallState;
use crate::session::{ScopeId, SessionId};
use thiserror::Error;

/// Capture device could not be opened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by a session/signal/membership backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error("cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: CallState },

    #[error("no one else to call in {0}")]
    NoRecipient(ScopeId),

    #[error("call session {0} no longer exists")]
    SessionGone(SessionId),

    #[error("session store: {0}")]
    Store(#[from] StoreError),

    #[error("call service stopped")]
    Stopped,
}

#[derive(Debug, Error)]
#[error("signaling write failed: {0}")]
pub struct SignalingWriteError(#[from] pub StoreError);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload exceeds {0} bytes once decompressed")]
    TooLarge(u64),
}

/// Why an incoming signal was not applied.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("stale signal: {0}")]
    Stale(String),

    #[error("malformed signal: {0}")]
    Malformed(#[from] CodecError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Write(#[from] SignalingWriteError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid ICE server {id}: {reason}")]
    InvalidIceServer { id: String, reason: &'static str },

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
