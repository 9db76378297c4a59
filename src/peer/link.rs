use crate::error::PeerError;
use crate::logger::dump_candidate;
use crate::peer::connection::PeerConnection;
use crate::peer::ice::{AppliedCandidates, PendingCandidates, RemoteCandidate};
use crate::peer::types::{NegotiationRole, SessionDescription};
use crate::session::UserId;
use log::{debug, warn};
use std::collections::HashSet;

/// Result of handing a remote candidate to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
    Duplicate,
    /// From a remote link generation this link has moved past.
    Stale,
    Rejected,
}

/// Connection to one remote participant, owned by the link manager.
pub struct PeerLink {
    link_id: String,
    remote_id: UserId,
    role: NegotiationRole,
    connection: Box<dyn PeerConnection>,
    /// Remote link generation bound by the applied remote description.
    remote_link_id: Option<String>,
    pending: PendingCandidates,
    /// Bound, but from another generation; a restart may still claim them.
    foreign: PendingCandidates,
    retired: HashSet<String>,
    applied: AppliedCandidates,
}

impl PeerLink {
    pub fn new(
        link_id: String,
        remote_id: UserId,
        role: NegotiationRole,
        connection: Box<dyn PeerConnection>,
    ) -> Self {
        Self {
            link_id,
            remote_id,
            role,
            connection,
            remote_link_id: None,
            pending: PendingCandidates::default(),
            foreign: PendingCandidates::default(),
            retired: HashSet::new(),
            applied: AppliedCandidates::default(),
        }
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn remote_id(&self) -> &UserId {
        &self.remote_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn remote_link_id(&self) -> Option<&str> {
        self.remote_link_id.as_deref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_link_id.is_some()
    }

    /// Offer sent, no answer applied yet.
    pub fn awaiting_answer(&self) -> bool {
        self.role == NegotiationRole::Offerer && !self.has_remote_description()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    pub fn connection(&self) -> &dyn PeerConnection {
        self.connection.as_ref()
    }

    /// Everything not yet applied, whatever generation it came from.
    pub(crate) fn take_pending(&mut self) -> PendingCandidates {
        let mut all = std::mem::take(&mut self.pending);
        all.absorb(std::mem::take(&mut self.foreign));
        all
    }

    /// Candidates from `remote_link_id` are refused from now on.
    pub(crate) fn retire(&mut self, remote_link_id: String) {
        self.retired.insert(remote_link_id);
    }

    pub(crate) fn absorb_pending(&mut self, pending: PendingCandidates) {
        self.pending.absorb(pending);
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.connection.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.connection.create_answer().await
    }

    /// Applies the remote description, then flushes buffered candidates
    /// that belong to `remote_link_id`. Returns how many were applied.
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
        remote_link_id: &str,
    ) -> Result<usize, PeerError> {
        self.connection.set_remote_description(desc).await?;
        if let Some(previous) = self.remote_link_id.replace(remote_link_id.to_owned()) {
            if previous != remote_link_id {
                self.retired.insert(previous);
            }
        }

        let mut queued = self.pending.drain();
        queued.extend(self.foreign.drain());
        let mut flushed = 0;
        for candidate in queued {
            if candidate.link_id == remote_link_id {
                if self.apply(candidate).await == CandidateOutcome::Applied {
                    flushed += 1;
                }
            } else if self.retired.contains(&candidate.link_id) {
                debug!(
                    "Discarding buffered candidate from stale link {} of {}",
                    candidate.link_id, self.remote_id
                );
            } else {
                self.foreign.push(candidate);
            }
        }
        Ok(flushed)
    }

    pub async fn add_candidate(&mut self, candidate: RemoteCandidate) -> CandidateOutcome {
        if !candidate.candidate.is_well_formed() {
            return CandidateOutcome::Rejected;
        }
        match self.remote_link_id.as_deref() {
            None => {
                if self.pending.push(candidate) {
                    CandidateOutcome::Buffered
                } else {
                    CandidateOutcome::Duplicate
                }
            }
            Some(bound) if bound != candidate.link_id => {
                if self.retired.contains(&candidate.link_id) {
                    CandidateOutcome::Stale
                } else if self.foreign.push(candidate) {
                    CandidateOutcome::Buffered
                } else {
                    CandidateOutcome::Duplicate
                }
            }
            Some(_) => self.apply(candidate).await,
        }
    }

    async fn apply(&mut self, candidate: RemoteCandidate) -> CandidateOutcome {
        if self.applied.contains(&candidate.candidate) {
            return CandidateOutcome::Duplicate;
        }
        dump_candidate("REMOTE", self.remote_id.as_str(), &candidate.candidate);
        match self.connection.add_ice_candidate(candidate.candidate.clone()).await {
            Ok(()) => {
                self.applied.insert(&candidate.candidate);
                CandidateOutcome::Applied
            }
            Err(e) => {
                warn!("Dropping candidate from {}: {e}", self.remote_id);
                // not retried: a rejected candidate stays rejected
                self.applied.insert(&candidate.candidate);
                CandidateOutcome::Rejected
            }
        }
    }

    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            debug!("Closing link to {}: {e}", self.remote_id);
        }
    }
}
