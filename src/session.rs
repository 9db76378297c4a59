//! Shared call session record and the store it lives in.

use crate::error::StoreError;
use crate::subscription::Subscription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Participant identity.
    UserId
);
string_id!(
    /// Call session identifier, generated by the initiator.
    SessionId
);
string_id!(
    /// Discussion or group identifier.
    ScopeId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Who a new call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// Everyone in a group discussion.
    Group(ScopeId),
    /// The other member of a 1:1 discussion.
    Direct(ScopeId),
    /// A single user, without a discussion.
    User(UserId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: SessionId,
    /// None for a direct call addressed by `receiver_id`.
    pub scope_id: Option<ScopeId>,
    pub initiator_id: UserId,
    pub receiver_id: Option<UserId>,
    pub media_kind: MediaKind,
    pub participants: BTreeSet<UserId>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// New ACTIVE session with the initiator as sole participant.
    pub fn new(
        id: SessionId,
        initiator_id: UserId,
        scope_id: Option<ScopeId>,
        receiver_id: Option<UserId>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            id,
            scope_id,
            participants: BTreeSet::from([initiator_id.clone()]),
            initiator_id,
            receiver_id,
            media_kind,
            status: SessionStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active && !self.participants.is_empty()
    }

    pub fn is_direct(&self) -> bool {
        self.scope_id.is_none()
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Participants other than `user`.
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| *p != user)
    }

    /// Keeps the ACTIVE-iff-non-empty invariant after a removal.
    pub(crate) fn settle_status(&mut self) {
        if self.participants.is_empty() {
            self.status = SessionStatus::Ended;
        }
    }
}

/// Which session records a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// ACTIVE sessions addressed to `user` directly or through one of `scopes`.
    Eligible { user: UserId, scopes: Vec<ScopeId> },
    /// A single session, whatever its status.
    Session(SessionId),
}

impl SessionFilter {
    pub fn matches(&self, session: &CallSession) -> bool {
        match self {
            Self::Eligible { user, scopes } => {
                session.is_active()
                    && (session.receiver_id.as_ref() == Some(user)
                        || session
                            .scope_id
                            .as_ref()
                            .is_some_and(|scope| scopes.contains(scope)))
            }
            Self::Session(id) => &session.id == id,
        }
    }
}

/// Change notification, with query semantics relative to a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Added(CallSession),
    Modified(CallSession),
    /// Deleted, or no longer matching the filter. Carries the last known record.
    Removed(CallSession),
}

impl SessionChange {
    pub fn session(&self) -> &CallSession {
        match self {
            Self::Added(s) | Self::Modified(s) | Self::Removed(s) => s,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &CallSession) -> Result<(), StoreError>;

    async fn get(&self, id: &SessionId) -> Result<Option<CallSession>, StoreError>;

    /// Atomic set-union. Returns the updated record, or None if it is gone.
    async fn add_participant(
        &self,
        id: &SessionId,
        user: &UserId,
    ) -> Result<Option<CallSession>, StoreError>;

    /// Atomic set-removal. Returns the updated record, or None if it is gone.
    async fn remove_participant(
        &self,
        id: &SessionId,
        user: &UserId,
    ) -> Result<Option<CallSession>, StoreError>;

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        filter: SessionFilter,
    ) -> Result<Subscription<SessionChange>, StoreError>;
}

/// Resolves discussions to their members.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    async fn members(&self, scope: &ScopeId) -> Result<Vec<UserId>, StoreError>;

    async fn scopes_for(&self, user: &UserId) -> Result<Vec<ScopeId>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_session() -> CallSession {
        CallSession::new(
            SessionId::from("s1"),
            UserId::from("alice"),
            Some(ScopeId::from("team")),
            None,
            MediaKind::Video,
        )
    }

    #[test]
    fn new_session_has_initiator_as_member() {
        let session = group_session();
        assert!(session.is_active());
        assert_eq!(
            session.participants.iter().collect::<Vec<_>>(),
            vec![&UserId::from("alice")]
        );
        assert_eq!(session.others(&UserId::from("alice")).count(), 0);
    }

    #[test]
    fn emptied_session_ends() {
        let mut session = group_session();
        session.participants.clear();
        session.settle_status();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(!session.is_active());
    }

    #[test]
    fn eligibility_by_scope_or_receiver() {
        let bob = UserId::from("bob");
        let filter = SessionFilter::Eligible {
            user: bob.clone(),
            scopes: vec![ScopeId::from("team")],
        };
        assert!(filter.matches(&group_session()));

        let direct = CallSession::new(
            SessionId::from("s2"),
            UserId::from("carol"),
            None,
            Some(bob.clone()),
            MediaKind::Audio,
        );
        assert!(filter.matches(&direct));

        let elsewhere = CallSession::new(
            SessionId::from("s3"),
            UserId::from("carol"),
            Some(ScopeId::from("other")),
            None,
            MediaKind::Audio,
        );
        assert!(!filter.matches(&elsewhere));

        let mut ended = group_session();
        ended.status = SessionStatus::Ended;
        assert!(!filter.matches(&ended));
    }

    #[test]
    fn record_serializes_with_uppercase_enums() {
        let json = serde_json::to_value(group_session()).unwrap();
        assert_eq!(json["media_kind"], "VIDEO");
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["participants"][0], "alice");
    }
}
