//! Incoming-call detection over the session record store.

use crate::error::StoreError;
use crate::session::{
    CallSession, MembershipProvider, SessionChange, SessionFilter, SessionId, SessionStore, UserId,
};
use crate::subscription::Subscription;
use log::{debug, info};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A session someone else started that the local user may join.
    Incoming(CallSession),
    /// A previously announced session is gone or no longer eligible.
    Ended(SessionId),
}

/// Watches ACTIVE sessions addressed to the local user, directly or
/// through one of their discussions.
pub struct CallDirectoryListener {
    local_id: UserId,
    feed: Subscription<SessionChange>,
    announced: HashSet<SessionId>,
}

impl CallDirectoryListener {
    /// Eligible scopes are resolved once, when the listener starts.
    pub async fn start(
        local_id: UserId,
        sessions: &dyn SessionStore,
        membership: &dyn MembershipProvider,
    ) -> Result<Self, StoreError> {
        let scopes = membership.scopes_for(&local_id).await?;
        debug!("Directory for {local_id} watching {} scope(s)", scopes.len());
        let feed = sessions
            .subscribe(SessionFilter::Eligible {
                user: local_id.clone(),
                scopes,
            })
            .await?;
        Ok(Self {
            local_id,
            feed,
            announced: HashSet::new(),
        })
    }

    /// Next event worth surfacing. None once the store closed the feed.
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<DirectoryEvent> {
        loop {
            let change = self.feed.recv().await?;
            if let Some(event) = self.classify(change) {
                return Some(event);
            }
        }
    }

    fn classify(&mut self, change: SessionChange) -> Option<DirectoryEvent> {
        match change {
            SessionChange::Added(session) | SessionChange::Modified(session) => {
                if session.initiator_id == self.local_id {
                    return None;
                }
                if !self.announced.insert(session.id.clone()) {
                    return None;
                }
                info!(
                    "Incoming {:?} call {} from {}",
                    session.media_kind, session.id, session.initiator_id
                );
                Some(DirectoryEvent::Incoming(session))
            }
            SessionChange::Removed(session) => self
                .announced
                .remove(&session.id)
                .then_some(DirectoryEvent::Ended(session.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::session::{MediaKind, ScopeId};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn listener(store: &MemoryStore, user: &str) -> CallDirectoryListener {
        CallDirectoryListener::start(UserId::from(user), store, store)
            .await
            .unwrap()
    }

    fn group_call(id: &str, initiator: &str, scope: &str) -> CallSession {
        CallSession::new(
            SessionId::from(id),
            UserId::from(initiator),
            Some(ScopeId::from(scope)),
            None,
            MediaKind::Audio,
        )
    }

    async fn quiet(listener: &mut CallDirectoryListener) -> bool {
        timeout(Duration::from_millis(50), listener.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn group_members_are_notified_once() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob"]);
        let mut bob = listener(&store, "bob").await;

        store.create(&group_call("s1", "alice", "team")).await.unwrap();
        match bob.next().await {
            Some(DirectoryEvent::Incoming(s)) => assert_eq!(s.id, SessionId::from("s1")),
            other => panic!("unexpected {other:?}"),
        }

        // growth of an announced call is not a new incoming call
        store
            .add_participant(&SessionId::from("s1"), &UserId::from("carol"))
            .await
            .unwrap();
        assert!(quiet(&mut bob).await);

        store.delete(&SessionId::from("s1")).await.unwrap();
        assert_eq!(
            bob.next().await,
            Some(DirectoryEvent::Ended(SessionId::from("s1")))
        );
    }

    #[tokio::test]
    async fn own_calls_and_foreign_scopes_are_ignored() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob"]);
        store.set_members("other", ["carol", "dave"]);
        let mut alice = listener(&store, "alice").await;

        store.create(&group_call("mine", "alice", "team")).await.unwrap();
        store.create(&group_call("theirs", "carol", "other")).await.unwrap();
        assert!(quiet(&mut alice).await);

        store.delete(&SessionId::from("mine")).await.unwrap();
        assert!(quiet(&mut alice).await);
    }

    #[tokio::test]
    async fn direct_calls_reach_the_receiver() {
        let store = MemoryStore::new();
        let mut bob = listener(&store, "bob").await;
        let direct = CallSession::new(
            SessionId::from("d1"),
            UserId::from("alice"),
            None,
            Some(UserId::from("bob")),
            MediaKind::Video,
        );
        store.create(&direct).await.unwrap();
        assert_eq!(bob.next().await, Some(DirectoryEvent::Incoming(direct)));
    }

    #[tokio::test]
    async fn existing_calls_are_announced_at_start() {
        let store = MemoryStore::new();
        store.set_members("team", ["alice", "bob"]);
        store.create(&group_call("s1", "alice", "team")).await.unwrap();
        let mut bob = listener(&store, "bob").await;
        assert!(matches!(bob.next().await, Some(DirectoryEvent::Incoming(_))));
    }
}
