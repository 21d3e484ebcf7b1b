use std::collections::{HashSet, VecDeque};

use crate::protocol::IceCandidate;

/// What the session should do with a remote candidate it just received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No remote description yet; held until [`CandidateBuffer::flush`].
    Queued,
    /// Apply to the engine now.
    Apply(IceCandidate),
    /// Already applied (or already handed out); re-delivery is a no-op.
    Duplicate,
    /// End-of-candidates marker for the current round.
    EndOfCandidates,
    /// Arrived after the round's end-of-candidates marker.
    Stale,
}

/// Per-session holding queue for inbound connectivity candidates.
///
/// Until the remote description is installed every arrival is queued in
/// order. [`flush`](Self::flush) runs once, when the remote description
/// lands, hands back the queue in arrival order and switches to
/// immediate mode. The end-of-candidates marker travels through the queue
/// like any entry but is never handed out for application.
///
/// A candidate is recorded as applied when it is handed out, so a repeat
/// delivery of the same candidate never reaches the engine twice.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<Option<IceCandidate>>,
    applied: HashSet<IceCandidate>,
    flushed: bool,
    end_of_candidates: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one inbound candidate (`None` = end-of-candidates).
    pub fn enqueue(&mut self, candidate: Option<IceCandidate>) -> Admission {
        if !self.flushed {
            self.queue.push_back(candidate);
            return Admission::Queued;
        }
        self.admit(candidate)
    }

    /// Release everything queued so far, in arrival order, skipping
    /// duplicates and consuming end-of-candidates markers.
    ///
    /// Only the first call returns anything.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        if self.flushed {
            tracing::warn!("candidate buffer flushed twice; ignoring");
            return Vec::new();
        }
        self.flushed = true;

        let queued: Vec<_> = self.queue.drain(..).collect();
        let mut ready = Vec::with_capacity(queued.len());
        for entry in queued {
            if let Admission::Apply(candidate) = self.admit(entry) {
                ready.push(candidate);
            }
        }
        ready
    }

    /// Start a new negotiation round: the previous round's
    /// end-of-candidates marker no longer applies.
    pub fn begin_round(&mut self) {
        self.end_of_candidates = false;
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn end_of_candidates(&self) -> bool {
        self.end_of_candidates
    }

    fn admit(&mut self, candidate: Option<IceCandidate>) -> Admission {
        match candidate {
            None => {
                self.end_of_candidates = true;
                Admission::EndOfCandidates
            }
            Some(_) if self.end_of_candidates => Admission::Stale,
            Some(c) if self.applied.contains(&c) => Admission::Duplicate,
            Some(c) => {
                self.applied.insert(c.clone());
                Admission::Apply(c)
            }
        }
    }
}
