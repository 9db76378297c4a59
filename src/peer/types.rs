use crate::error::PeerError;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Which side of the offer/answer exchange a link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged as OFFER/ANSWER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_rtc(&self) -> Result<RTCSessionDescription, PeerError> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone())?,
        };
        Ok(desc)
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self, PeerError> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(PeerError::InvalidDescription(format!(
                    "unsupported sdp type {other}"
                )))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// One trickled ICE candidate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Identity used for duplicate suppression.
    pub fn key(&self) -> (String, Option<String>, Option<u16>) {
        (
            self.candidate.clone(),
            self.sdp_mid.clone(),
            self.sdp_mline_index,
        )
    }

    pub fn is_well_formed(&self) -> bool {
        !self.candidate.trim().is_empty()
    }
}

/// ICE server entry as configured by the embedding application.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // "stun" or "turn"
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Lost connectivity; may still recover.
    Disconnected,
    /// Did not recover within the grace period.
    Failed,
    Closed,
}
