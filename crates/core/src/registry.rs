//! Host-side fan-out table.
//!
//! One host channel carries every client. The registry maps each
//! [`RendezvousCode`] to the [`SessionHandle`] of the task that owns that
//! client's [`Session`](crate::session::Session). The registry never owns
//! sessions; it only holds the means to reach them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, SignalError, ViolationKind};
use crate::protocol::{RendezvousCode, SignalingMessage};
use crate::session::{NegotiationState, Trigger};

/// Reaches one session task: its trigger queue plus its published state.
#[derive(Clone)]
pub struct SessionHandle {
    triggers: mpsc::UnboundedSender<Trigger>,
    state: watch::Receiver<NegotiationState>,
}

impl SessionHandle {
    pub fn new(
        triggers: mpsc::UnboundedSender<Trigger>,
        state: watch::Receiver<NegotiationState>,
    ) -> Self {
        Self { triggers, state }
    }

    /// Queue a trigger. Returns `false` if the session task has exited.
    pub fn send(&self, trigger: Trigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }
}

/// Thread-safe `code -> session` map.
///
/// `register`/`unregister` take the write lock, so a code can never be
/// claimed twice. `route` only reads.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<RendezvousCode, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `code` for `handle`. A code already present is a
    /// [`DuplicateCode`](ViolationKind::DuplicateCode) violation and the
    /// existing entry is left untouched.
    pub fn register(&self, code: RendezvousCode, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&code) {
            tracing::warn!(%code, "rejecting duplicate registration");
            return Err(SignalError::violation(ViolationKind::DuplicateCode(code)));
        }
        sessions.insert(code.clone(), handle);
        tracing::debug!(%code, total_sessions = sessions.len(), "session registered");
        Ok(())
    }

    /// Forward a peer message to the session owning `code`.
    pub fn route(&self, code: &RendezvousCode, message: SignalingMessage) -> Result<()> {
        let handle = self.sessions.read().get(code).cloned();
        let Some(handle) = handle else {
            return Err(SignalError::violation(ViolationKind::UnknownCode(
                code.clone(),
            )));
        };
        tracing::trace!(%code, message = message.label(), "routing");
        if !handle.send(Trigger::Remote(message)) {
            // Task already gone; its unregister is racing us.
            tracing::debug!(%code, "session task exited before delivery");
        }
        Ok(())
    }

    pub fn unregister(&self, code: &RendezvousCode) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(code);
        if removed.is_some() {
            tracing::debug!(%code, total_sessions = sessions.len(), "session unregistered");
        }
        removed
    }

    pub fn contains(&self, code: &RendezvousCode) -> bool {
        self.sessions.read().contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn codes(&self) -> Vec<RendezvousCode> {
        let mut codes: Vec<_> = self.sessions.read().keys().cloned().collect();
        codes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        codes
    }

    /// Last published state of the session for `code`.
    pub fn state(&self, code: &RendezvousCode) -> Option<NegotiationState> {
        self.sessions.read().get(code).map(SessionHandle::state)
    }

    /// Tell the session for `code` its peer is gone. `false` if no such
    /// session is registered.
    pub fn close(&self, code: &RendezvousCode) -> bool {
        match self.sessions.read().get(code) {
            Some(handle) => {
                handle.send(Trigger::ChannelClosed);
                true
            }
            None => false,
        }
    }

    /// Tell every session its channel is gone. Entries stay until each
    /// task unregisters itself.
    pub fn close_all(&self) -> usize {
        let sessions = self.sessions.read();
        for handle in sessions.values() {
            handle.send(Trigger::ChannelClosed);
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IceCandidate;

    fn handle() -> (
        SessionHandle,
        mpsc::UnboundedReceiver<Trigger>,
        watch::Sender<NegotiationState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        (SessionHandle::new(tx, state_rx), rx, state_tx)
    }

    #[test]
    fn duplicate_code_is_rejected() {
        let registry = SessionRegistry::new();
        let (first, _rx1, _s1) = handle();
        let (second, _rx2, _s2) = handle();
        let code = RendezvousCode::from("C1");

        registry.register(code.clone(), first).unwrap();
        let err = registry.register(code.clone(), second).unwrap_err();
        assert!(matches!(
            err,
            SignalError::ProtocolViolation {
                kind: ViolationKind::DuplicateCode(_)
            }
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_code_is_never_delivered() {
        let registry = SessionRegistry::new();
        let (a, mut rx, _s) = handle();
        registry.register(RendezvousCode::from("A"), a).unwrap();

        let err = registry
            .route(
                &RendezvousCode::from("B"),
                SignalingMessage::Candidate(None),
            )
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn routes_only_to_the_tagged_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a, _sa) = handle();
        let (b, mut rx_b, _sb) = handle();
        registry.register(RendezvousCode::from("A"), a).unwrap();
        registry.register(RendezvousCode::from("B"), b).unwrap();

        let msg = SignalingMessage::Candidate(Some(IceCandidate::new("candidate:a")));
        registry
            .route(&RendezvousCode::from("A"), msg.clone())
            .unwrap();

        assert_eq!(rx_a.try_recv().unwrap(), Trigger::Remote(msg));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unregister_frees_the_code() {
        let registry = SessionRegistry::new();
        let code = RendezvousCode::from("A");
        let (a, _rx, state) = handle();
        registry.register(code.clone(), a).unwrap();

        state.send_replace(NegotiationState::Connected);
        assert_eq!(registry.state(&code), Some(NegotiationState::Connected));

        assert!(registry.unregister(&code).is_some());
        assert!(registry.unregister(&code).is_none());
        assert!(registry.is_empty());

        let (again, _rx2, _s2) = handle();
        registry.register(code, again).unwrap();
    }

    #[test]
    fn close_all_notifies_every_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a, _sa) = handle();
        let (b, mut rx_b, _sb) = handle();
        registry.register(RendezvousCode::from("B"), b).unwrap();
        registry.register(RendezvousCode::from("A"), a).unwrap();
        assert_eq!(
            registry.codes(),
            vec![RendezvousCode::from("A"), RendezvousCode::from("B")]
        );

        assert_eq!(registry.close_all(), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Trigger::ChannelClosed);
        assert_eq!(rx_b.try_recv().unwrap(), Trigger::ChannelClosed);
    }

    #[test]
    fn close_reaches_one_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a, _sa) = handle();
        let (b, mut rx_b, _sb) = handle();
        registry.register(RendezvousCode::from("A"), a).unwrap();
        registry.register(RendezvousCode::from("B"), b).unwrap();

        assert!(registry.close(&RendezvousCode::from("A")));
        assert!(!registry.close(&RendezvousCode::from("C")));
        assert_eq!(rx_a.try_recv().unwrap(), Trigger::ChannelClosed);
        assert!(rx_b.try_recv().is_err());
        // Entry stays until the session task unregisters.
        assert_eq!(registry.len(), 2);
    }
}
