use crate::peer::types::IceCandidate;
use std::collections::HashSet;

type CandidateKey = (String, Option<String>, Option<u16>);

/// Remote candidate together with the remote link generation that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub link_id: String,
    pub candidate: IceCandidate,
}

/// Candidates received before the remote description was set.
/// Insertion order is kept; duplicates are refused.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<RemoteCandidate>,
    seen: HashSet<CandidateKey>,
}

impl PendingCandidates {
    /// Returns false for a duplicate.
    pub fn push(&mut self, candidate: RemoteCandidate) -> bool {
        if !self.seen.insert(candidate.candidate.key()) {
            return false;
        }
        self.queue.push(candidate);
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Empties the buffer.
    pub fn drain(&mut self) -> Vec<RemoteCandidate> {
        self.seen.clear();
        std::mem::take(&mut self.queue)
    }

    /// Moves everything from `other` into `self`, keeping duplicate suppression.
    pub fn absorb(&mut self, mut other: PendingCandidates) {
        for candidate in other.drain() {
            self.push(candidate);
        }
    }
}

/// Candidates already handed to the transport.
#[derive(Debug, Default)]
pub struct AppliedCandidates {
    seen: HashSet<CandidateKey>,
}

impl AppliedCandidates {
    pub fn contains(&self, candidate: &IceCandidate) -> bool {
        self.seen.contains(&candidate.key())
    }

    pub fn insert(&mut self, candidate: &IceCandidate) -> bool {
        self.seen.insert(candidate.key())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
