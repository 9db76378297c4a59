//! In-process document store backing sessions, signals and membership.
//!
//! Change feeds follow query semantics: each subscriber gets
//! Added/Modified/Removed relative to its own filter.

use crate::error::StoreError;
use crate::session::{
    CallSession, MembershipProvider, ScopeId, SessionChange, SessionFilter, SessionId,
    SessionStore, UserId,
};
use crate::signaling::{SignalMessage, SignalStore};
use crate::subscription::Subscription;
use async_trait::async_trait;
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct SessionWatcher {
    filter: SessionFilter,
    tx: mpsc::UnboundedSender<SessionChange>,
}

struct SignalWatcher {
    session: SessionId,
    to: UserId,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, CallSession>,
    signals: HashMap<SessionId, Vec<SignalMessage>>,
    scopes: HashMap<ScopeId, Vec<UserId>>,
    session_watchers: HashMap<u64, SessionWatcher>,
    signal_watchers: HashMap<u64, SignalWatcher>,
    next_watcher: u64,
}

impl Inner {
    fn watcher_id(&mut self) -> u64 {
        self.next_watcher += 1;
        self.next_watcher
    }

    fn publish(&mut self, before: Option<&CallSession>, after: Option<&CallSession>) {
        self.session_watchers.retain(|_, watcher| {
            let was = before.filter(|s| watcher.filter.matches(s));
            let is = after.filter(|s| watcher.filter.matches(s));
            let change = match (was, is) {
                (None, Some(s)) => SessionChange::Added(s.clone()),
                (Some(_), Some(s)) => SessionChange::Modified(s.clone()),
                (Some(s), None) => SessionChange::Removed(s.clone()),
                (None, None) => return !watcher.tx.is_closed(),
            };
            watcher.tx.send(change).is_ok()
        });
    }

    fn update<F>(&mut self, id: &SessionId, mutate: F) -> Option<CallSession>
    where
        F: FnOnce(&mut CallSession),
    {
        let before = self.sessions.get(id)?.clone();
        let mut after = before.clone();
        mutate(&mut after);
        if after == before {
            return Some(after);
        }
        self.sessions.insert(id.clone(), after.clone());
        self.publish(Some(&before), Some(&after));
        Some(after)
    }
}

/// Shared in-memory store. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // no operation can leave Inner half-updated, so poisoning is benign
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers (or replaces) the members of a discussion.
    pub fn set_members<I, U>(&self, scope: impl Into<ScopeId>, members: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        self.lock()
            .scopes
            .insert(scope.into(), members.into_iter().map(Into::into).collect());
    }

    pub fn session(&self, id: &SessionId) -> Option<CallSession> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn signals(&self, id: &SessionId) -> Vec<SignalMessage> {
        self.lock().signals.get(id).cloned().unwrap_or_default()
    }

    /// Live listeners, for leak checks.
    pub fn watcher_count(&self) -> usize {
        let inner = self.lock();
        inner.session_watchers.len() + inner.signal_watchers.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &CallSession) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Backend(format!(
                "session {} already exists",
                session.id
            )));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        inner.publish(None, Some(session));
        trace!("memory store: created session {}", session.id);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<CallSession>, StoreError> {
        Ok(self.lock().sessions.get(id).cloned())
    }

    async fn add_participant(
        &self,
        id: &SessionId,
        user: &UserId,
    ) -> Result<Option<CallSession>, StoreError> {
        Ok(self.lock().update(id, |s| {
            s.participants.insert(user.clone());
        }))
    }

    async fn remove_participant(
        &self,
        id: &SessionId,
        user: &UserId,
    ) -> Result<Option<CallSession>, StoreError> {
        Ok(self.lock().update(id, |s| {
            s.participants.remove(user);
            s.settle_status();
        }))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let removed = inner
            .sessions
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        inner.signals.remove(id);
        inner.publish(Some(&removed), None);
        trace!("memory store: deleted session {id}");
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: SessionFilter,
    ) -> Result<Subscription<SessionChange>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for session in inner.sessions.values().filter(|s| filter.matches(s)) {
            let _ = tx.send(SessionChange::Added(session.clone()));
        }
        let id = inner.watcher_id();
        inner.session_watchers.insert(id, SessionWatcher { filter, tx });

        let store = self.inner.clone();
        Ok(Subscription::with_cancel(rx, move || {
            store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .session_watchers
                .remove(&id);
        }))
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn send(&self, message: SignalMessage) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(&message.session_id) {
            return Err(StoreError::NotFound(message.session_id.to_string()));
        }
        inner.signal_watchers.retain(|_, watcher| {
            if watcher.session != message.session_id || watcher.to != message.to {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(message.clone()).is_ok()
        });
        inner
            .signals
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        session: &SessionId,
        to: &UserId,
    ) -> Result<Subscription<SignalMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for message in inner
            .signals
            .get(session)
            .into_iter()
            .flatten()
            .filter(|m| &m.to == to)
        {
            let _ = tx.send(message.clone());
        }
        let id = inner.watcher_id();
        inner.signal_watchers.insert(
            id,
            SignalWatcher {
                session: session.clone(),
                to: to.clone(),
                tx,
            },
        );

        let store = self.inner.clone();
        Ok(Subscription::with_cancel(rx, move || {
            store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .signal_watchers
                .remove(&id);
        }))
    }
}

#[async_trait]
impl MembershipProvider for MemoryStore {
    async fn members(&self, scope: &ScopeId) -> Result<Vec<UserId>, StoreError> {
        self.lock()
            .scopes
            .get(scope)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(scope.to_string()))
    }

    async fn scopes_for(&self, user: &UserId) -> Result<Vec<ScopeId>, StoreError> {
        let mut scopes: Vec<ScopeId> = self
            .lock()
            .scopes
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        Ok(scopes)
    }
}
