pub mod connection;
pub mod ice;
pub mod link;
pub mod manager;
pub mod types;

pub use connection::{
    LinkEvent, LinkEventKind, LinkEventSink, PeerConnection, PeerConnector, RemoteTrack,
    RtcConnector,
};
pub use link::{CandidateOutcome, PeerLink};
pub use manager::{PeerLinkManager, RemoteStream, RemoteStreams, SignalOutcome};
pub use types::{IceCandidate, LinkState, NegotiationRole, SdpKind, ServerConfig, SessionDescription};
