//! Negotiation state machine.
//!
//! A [`Session`] sequences one peer pairing through offer/answer rounds.
//! It is sans-IO: every trigger mutates state, drives the [`MediaEngine`],
//! and queues outbound [`SignalingMessage`]s. Whoever owns the session
//! drains them with [`Session::poll_output`] after each trigger and puts
//! them on the wire.
//!
//! ## Lifecycle
//!
//! ```text
//! Offerer:   Idle -> CreatingOffer -> OfferSet -> AwaitingAnswer -> Connected
//! Answerer:  Idle -> AwaitingOffer -> OfferReceived -> CreatingAnswer
//!                 -> AnswerSet -> Connected
//! Connected -> Renegotiating -> (next round, same path)
//! any       -> Failed   (sticky)
//! any       -> Closed   (channel closed; Failed stays Failed)
//! ```
//!
//! ## Ordering rules
//!
//! - A local description is queued for sending only after the engine has
//!   installed it.
//! - Remote candidates go through the [`CandidateBuffer`] and reach the
//!   engine only once a remote description is installed.
//! - Each round has at most one local and one remote description.
//!
//! Only the offerer starts new rounds. An offer that arrives while this
//! side's own offer is in flight is a [`NegotiationCollision`].
//!
//! [`NegotiationCollision`]: SignalError::NegotiationCollision

pub mod candidates;

use std::collections::VecDeque;

use tokio::sync::watch;

use crate::config::NegotiationPolicy;
use crate::error::{Result, SignalError, ViolationKind};
use crate::media::{MediaEngine, MediaTrack};
use crate::protocol::{IceCandidate, SessionDescription, SignalingMessage};

pub use candidates::{Admission, CandidateBuffer};

/// Negotiation state (see module docs for the transition graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingOffer,
    CreatingOffer,
    OfferSet,
    AwaitingAnswer,
    OfferReceived,
    CreatingAnswer,
    AnswerSet,
    Connected,
    Renegotiating,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// States in which this side's own offer is outstanding.
    fn offer_in_flight(self) -> bool {
        matches!(
            self,
            Self::CreatingOffer | Self::OfferSet | Self::AwaitingAnswer | Self::Renegotiating
        )
    }
}

/// Which side of the offer/answer exchange a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Everything that can move a session forward.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Local intent to negotiate (offerer only).
    Start,
    /// A local track became available.
    AddTrack(MediaTrack),
    /// A message from the peer.
    Remote(SignalingMessage),
    /// The engine discovered a local candidate (`None` = gathering done).
    LocalCandidate(Option<IceCandidate>),
    /// The signaling channel went away.
    ChannelClosed,
}

/// One negotiation with one peer.
pub struct Session<E> {
    label: String,
    role: Role,
    state: NegotiationState,
    state_tx: watch::Sender<NegotiationState>,
    round: u32,
    local: Option<SessionDescription>,
    local_round: Option<u32>,
    remote: Option<SessionDescription>,
    remote_round: Option<u32>,
    candidates: CandidateBuffer,
    held: Vec<Option<IceCandidate>>,
    policy: NegotiationPolicy,
    engine: E,
    outbox: VecDeque<SignalingMessage>,
    renegotiation_pending: bool,
}

impl<E: MediaEngine> Session<E> {
    pub fn new(label: impl Into<String>, role: Role, policy: NegotiationPolicy, engine: E) -> Self {
        let label = label.into();
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        tracing::info!(session = %label, ?role, early_trickle = policy.early_trickle, "session created");
        Self {
            label,
            role,
            state: NegotiationState::Idle,
            state_tx,
            round: 0,
            local: None,
            local_round: None,
            remote: None,
            remote_round: None,
            candidates: CandidateBuffer::new(),
            held: Vec::new(),
            policy,
            engine,
            outbox: VecDeque::new(),
            renegotiation_pending: false,
        }
    }

    /// Process one trigger. Any error is fatal: the session is `Failed`
    /// by the time it is returned.
    pub async fn handle(&mut self, trigger: Trigger) -> Result<()> {
        if self.state.is_terminal() {
            tracing::debug!(session = %self.label, state = ?self.state, ?trigger, "ignoring trigger on finished session");
            return Ok(());
        }
        let result = match trigger {
            Trigger::Start => self.start().await,
            Trigger::AddTrack(track) => self.add_track(track).await,
            Trigger::Remote(message) => self.on_message(message).await,
            Trigger::LocalCandidate(candidate) => {
                self.on_local_candidate(candidate);
                Ok(())
            }
            Trigger::ChannelClosed => {
                self.on_channel_closed();
                Ok(())
            }
        };
        result.map_err(|e| self.fail(e))
    }

    /// Begin the first round as offerer.
    pub async fn start(&mut self) -> Result<()> {
        if self.role != Role::Offerer || self.state != NegotiationState::Idle {
            return Err(self.unexpected("start"));
        }
        self.round = 1;
        self.set_state(NegotiationState::CreatingOffer);
        self.send_offer().await
    }

    /// Answerer: announce readiness for the peer's offer.
    pub fn await_offer(&mut self) -> Result<()> {
        if self.role != Role::Answerer || self.state != NegotiationState::Idle {
            return Err(self.unexpected("await-offer"));
        }
        self.set_state(NegotiationState::AwaitingOffer);
        Ok(())
    }

    /// Dispatch a peer message to the matching handler.
    pub async fn on_message(&mut self, message: SignalingMessage) -> Result<()> {
        tracing::trace!(session = %self.label, message = message.label(), state = ?self.state, "remote message");
        match message {
            SignalingMessage::Offer { sdp } => self.on_offer(sdp).await,
            SignalingMessage::Answer { sdp } => self.on_answer(sdp).await,
            SignalingMessage::Candidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        }
    }

    /// Install the peer's offer. Leaves the session in `OfferReceived`;
    /// call [`answer`](Self::answer) to reply.
    pub async fn on_offer(&mut self, sdp: String) -> Result<()> {
        if self.state.offer_in_flight() {
            return Err(SignalError::NegotiationCollision {
                state: self.state,
                round: self.round,
            });
        }
        let renegotiation = match (self.role, self.state) {
            (Role::Answerer, NegotiationState::Idle | NegotiationState::AwaitingOffer) => false,
            (Role::Answerer, NegotiationState::Connected) => true,
            _ => return Err(self.unexpected("offer")),
        };

        if renegotiation {
            self.begin_round();
            self.set_state(NegotiationState::Renegotiating);
        } else {
            self.round = 1;
        }
        self.install_remote(SessionDescription::offer(sdp)).await?;
        self.set_state(NegotiationState::OfferReceived);
        Ok(())
    }

    /// Produce, install and queue the answer to the offer just received.
    pub async fn answer(&mut self) -> Result<()> {
        if self.state != NegotiationState::OfferReceived {
            return Err(self.unexpected("answer"));
        }
        self.set_state(NegotiationState::CreatingAnswer);
        let answer = self.engine.create_answer().await?;
        self.install_local(answer.clone()).await?;
        self.set_state(NegotiationState::AnswerSet);
        self.outbox.push_back(answer.into());
        self.connected();
        Ok(())
    }

    pub async fn on_answer(&mut self, sdp: String) -> Result<()> {
        if self.state != NegotiationState::AwaitingAnswer {
            return Err(self.unexpected("answer"));
        }
        self.install_remote(SessionDescription::answer(sdp)).await?;
        self.connected();

        if self.renegotiation_pending {
            self.renegotiation_pending = false;
            self.renegotiate().await?;
        }
        Ok(())
    }

    /// Admit a peer candidate. Never fails: rejected or stale candidates
    /// are logged and dropped.
    pub async fn on_remote_candidate(&mut self, candidate: Option<IceCandidate>) {
        match self.candidates.enqueue(candidate) {
            Admission::Queued => {
                tracing::trace!(session = %self.label, pending = self.candidates.pending(), "candidate queued");
            }
            Admission::Apply(candidate) => self.apply_candidate(&candidate).await,
            Admission::Duplicate => {
                tracing::debug!(session = %self.label, "duplicate candidate ignored");
            }
            Admission::EndOfCandidates => {
                tracing::debug!(session = %self.label, round = self.round, "remote end-of-candidates");
            }
            Admission::Stale => {
                tracing::warn!(session = %self.label, round = self.round, "candidate after end-of-candidates dropped");
            }
        }
    }

    /// A candidate from our own engine: send now or hold, per policy.
    pub fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) {
        if self.may_trickle() {
            self.outbox.push_back(SignalingMessage::Candidate(candidate));
        } else {
            tracing::trace!(session = %self.label, state = ?self.state, "holding local candidate");
            self.held.push(candidate);
        }
    }

    /// Attach a local track. After `Connected` an offerer renegotiates; an
    /// offerer mid-round renegotiates once the round completes.
    pub async fn add_track(&mut self, track: MediaTrack) -> Result<()> {
        tracing::debug!(session = %self.label, track = %track.id, kind = ?track.kind, "adding track");
        self.engine.add_track(&track).await?;

        if self.role != Role::Offerer {
            return Ok(());
        }
        match self.state {
            NegotiationState::Connected => self.renegotiate().await,
            NegotiationState::Idle => Ok(()),
            _ => {
                self.renegotiation_pending = true;
                Ok(())
            }
        }
    }

    /// Start a new round from `Connected`, as offerer.
    pub async fn renegotiate(&mut self) -> Result<()> {
        if self.role != Role::Offerer || self.state != NegotiationState::Connected {
            return Err(self.unexpected("renegotiate"));
        }
        self.begin_round();
        self.set_state(NegotiationState::Renegotiating);
        self.send_offer().await
    }

    pub fn on_channel_closed(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.outbox.clear();
        self.held.clear();
        self.set_state(NegotiationState::Closed);
        tracing::info!(session = %self.label, round = self.round, "session closed");
    }

    /// Move to `Failed` and hand the error back.
    pub fn fail(&mut self, error: SignalError) -> SignalError {
        if !self.state.is_terminal() {
            tracing::error!(session = %self.label, state = ?self.state, round = self.round, error = %error, "session failed");
            self.outbox.clear();
            self.set_state(NegotiationState::Failed);
        }
        error
    }

    /// Drain messages queued for the peer, in send order.
    pub fn poll_output(&mut self) -> impl Iterator<Item = SignalingMessage> + '_ {
        self.outbox.drain(..)
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    /// Whether a remote description has been installed (in any round).
    pub fn remote_committed(&self) -> bool {
        self.remote.is_some()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self.engine.create_offer().await?;
        self.install_local(offer.clone()).await?;
        self.set_state(NegotiationState::OfferSet);
        self.outbox.push_back(offer.into());
        self.set_state(NegotiationState::AwaitingAnswer);
        if self.policy.early_trickle {
            self.release_held();
        }
        Ok(())
    }

    async fn install_local(&mut self, desc: SessionDescription) -> Result<()> {
        if self.local_round == Some(self.round) {
            return Err(SignalError::violation(ViolationKind::DescriptionReused {
                round: self.round,
            }));
        }
        self.engine.set_local_description(&desc).await?;
        self.local = Some(desc);
        self.local_round = Some(self.round);
        Ok(())
    }

    async fn install_remote(&mut self, desc: SessionDescription) -> Result<()> {
        if self.remote_round == Some(self.round) {
            return Err(SignalError::violation(ViolationKind::DescriptionReused {
                round: self.round,
            }));
        }
        self.engine.set_remote_description(&desc).await?;
        self.remote = Some(desc);
        self.remote_round = Some(self.round);

        if !self.candidates.is_flushed() {
            let ready = self.candidates.flush();
            tracing::debug!(session = %self.label, count = ready.len(), "replaying queued candidates");
            for candidate in ready {
                self.apply_candidate(&candidate).await;
            }
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            tracing::warn!(session = %self.label, error = %e, "engine rejected candidate");
        }
    }

    fn connected(&mut self) {
        self.set_state(NegotiationState::Connected);
        tracing::info!(session = %self.label, round = self.round, "session connected");
        self.release_held();
    }

    fn begin_round(&mut self) {
        self.round += 1;
        self.candidates.begin_round();
    }

    fn may_trickle(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.policy.early_trickle {
            self.local_round == Some(self.round)
        } else {
            self.state == NegotiationState::Connected
        }
    }

    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        tracing::debug!(session = %self.label, count = self.held.len(), "releasing held local candidates");
        for candidate in self.held.drain(..) {
            self.outbox.push_back(SignalingMessage::Candidate(candidate));
        }
    }

    fn unexpected(&self, message: &'static str) -> SignalError {
        SignalError::violation(ViolationKind::UnexpectedMessage {
            message,
            state: self.state,
        })
    }

    fn set_state(&mut self, state: NegotiationState) {
        tracing::debug!(session = %self.label, round = self.round, old_state = ?self.state, new_state = ?state, "state transition");
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
