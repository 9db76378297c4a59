//! Point-to-point negotiation messages and the per-session channel over them.

use crate::codec::{decode_payload, encode_payload};
use crate::error::{CodecError, SignalingWriteError, StoreError};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{SessionId, UserId};
use crate::subscription::Subscription;
use crate::utils::random_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Decoded payload of a [`SignalMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalBody {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// One negotiation message as stored in the session's signal log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: String,
    pub session_id: SessionId,
    pub kind: SignalKind,
    pub from: UserId,
    pub to: UserId,
    /// Generation of the sender's peer link.
    pub link_id: String,
    pub payload: String,
    pub sent_at: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(
        session_id: SessionId,
        from: UserId,
        to: UserId,
        link_id: impl Into<String>,
        body: &SignalBody,
    ) -> Result<Self, CodecError> {
        let payload = match body {
            SignalBody::Offer(desc) | SignalBody::Answer(desc) => encode_payload(desc)?,
            SignalBody::Candidate(candidate) => encode_payload(candidate)?,
        };
        Ok(Self {
            id: random_id(),
            session_id,
            kind: body.kind(),
            from,
            to,
            link_id: link_id.into(),
            payload,
            sent_at: Utc::now(),
        })
    }

    pub fn decode(&self, limit: u64) -> Result<SignalBody, CodecError> {
        Ok(match self.kind {
            SignalKind::Offer => SignalBody::Offer(decode_payload(&self.payload, limit)?),
            SignalKind::Answer => SignalBody::Answer(decode_payload(&self.payload, limit)?),
            SignalKind::Candidate => SignalBody::Candidate(decode_payload(&self.payload, limit)?),
        })
    }
}

/// Append-only signal log, one per session.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), StoreError>;

    /// Backlog addressed to `to` first, then new inserts.
    async fn subscribe(
        &self,
        session: &SessionId,
        to: &UserId,
    ) -> Result<Subscription<SignalMessage>, StoreError>;
}

/// Signal log of one session as seen by one endpoint.
pub struct SignalingChannel {
    store: Arc<dyn SignalStore>,
    session_id: SessionId,
    local_id: UserId,
    seen: HashSet<String>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalStore>, session_id: SessionId, local_id: UserId) -> Self {
        Self {
            store,
            session_id,
            local_id,
            seen: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub async fn send(
        &self,
        to: &UserId,
        link_id: &str,
        body: SignalBody,
    ) -> Result<(), SignalingWriteError> {
        let message = SignalMessage::new(
            self.session_id.clone(),
            self.local_id.clone(),
            to.clone(),
            link_id,
            &body,
        )
        .map_err(|e| StoreError::Backend(format!("encoding {:?}: {e}", body.kind())))?;
        debug!(
            "signal {:?} {} -> {} (session {})",
            message.kind, self.local_id, to, self.session_id
        );
        self.store.send(message).await?;
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<Subscription<SignalMessage>, StoreError> {
        self.store.subscribe(&self.session_id, &self.local_id).await
    }

    /// First delivery of a message addressed to us in this session.
    /// Re-deliveries and foreign messages are rejected.
    pub fn admit(&mut self, message: &SignalMessage) -> bool {
        message.session_id == self.session_id
            && message.to == self.local_id
            && self.seen.insert(message.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_DECOMPRESSED;
    use crate::memory::MemoryStore;
    use crate::session::{CallSession, MediaKind, SessionStore};

    #[test]
    fn message_payload_round_trips_through_decode() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let msg = SignalMessage::new(
            SessionId::from("s"),
            UserId::from("a"),
            UserId::from("b"),
            "l1",
            &SignalBody::Candidate(cand.clone()),
        )
        .unwrap();
        assert_eq!(msg.kind, SignalKind::Candidate);
        assert_eq!(
            msg.decode(DEFAULT_MAX_DECOMPRESSED).unwrap(),
            SignalBody::Candidate(cand)
        );
    }

    #[test]
    fn kind_mismatch_is_malformed() {
        let mut msg = SignalMessage::new(
            SessionId::from("s"),
            UserId::from("a"),
            UserId::from("b"),
            "l1",
            &SignalBody::Offer(SessionDescription::offer("v=0")),
        )
        .unwrap();
        msg.kind = SignalKind::Candidate;
        assert!(msg.decode(DEFAULT_MAX_DECOMPRESSED).is_err());
    }

    #[tokio::test]
    async fn channel_delivers_only_to_addressee_once() {
        let store = Arc::new(MemoryStore::new());
        let session = SessionId::from("s");
        store
            .create(&CallSession::new(
                session.clone(),
                UserId::from("alice"),
                None,
                Some(UserId::from("bob")),
                MediaKind::Audio,
            ))
            .await
            .unwrap();
        let alice = SignalingChannel::new(store.clone(), session.clone(), UserId::from("alice"));
        let mut bob = SignalingChannel::new(store.clone(), session.clone(), UserId::from("bob"));

        alice
            .send(
                &UserId::from("bob"),
                "l1",
                SignalBody::Offer(SessionDescription::offer("v=0")),
            )
            .await
            .unwrap();
        alice
            .send(
                &UserId::from("carol"),
                "l2",
                SignalBody::Offer(SessionDescription::offer("v=0")),
            )
            .await
            .unwrap();

        let mut sub = bob.subscribe().await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.to, UserId::from("bob"));
        assert!(bob.admit(&first));
        assert!(!bob.admit(&first));
        assert!(sub.try_recv().is_none());
    }
}
