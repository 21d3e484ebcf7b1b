//! Error types for the signaling library.

use std::fmt;

use crate::protocol::RendezvousCode;
use crate::session::NegotiationState;

/// Errors that can occur while negotiating a media session.
///
/// Every variant is terminal for the Session it was raised on. Nothing in
/// the core retries; errors propagate to the orchestrator, which hands them
/// to its caller.
///
/// - **Transport**: [`ChannelUnavailable`](Self::ChannelUnavailable),
///   [`Io`](Self::Io), [`AlreadyRunning`](Self::AlreadyRunning),
///   [`Config`](Self::Config).
/// - **Protocol**: [`ProtocolViolation`](Self::ProtocolViolation),
///   [`NegotiationCollision`](Self::NegotiationCollision).
/// - **Rendezvous**: [`RendezvousExhausted`](Self::RendezvousExhausted).
/// - **Media**: [`MediaUnavailable`](Self::MediaUnavailable),
///   [`Engine`](Self::Engine).
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The signaling transport could not be opened, or closed before the
    /// handshake completed.
    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Malformed message, message unexpected for the current state, or a
    /// duplicate/unknown rendezvous code.
    #[error("protocol violation: {kind}")]
    ProtocolViolation { kind: ViolationKind },

    /// An offer arrived while a round initiated by this side was in flight.
    #[error("negotiation collision: offer received while {state:?} in round {round}")]
    NegotiationCollision { state: NegotiationState, round: u32 },

    /// The rendezvous service had no counterpart (or no free host slot).
    #[error("rendezvous exhausted: {0}")]
    RendezvousExhausted(String),

    /// Capture device missing or permission denied.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// The underlying media engine rejected a description operation.
    #[error("media engine error: {0}")]
    Engine(String),

    /// Listener or socket failure in the rendezvous server.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already running")]
    AlreadyRunning,

    /// Rejected server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SignalError {
    pub fn violation(kind: ViolationKind) -> Self {
        Self::ProtocolViolation { kind }
    }

    /// Whether this error means the peer can no longer be trusted and its
    /// channel must be closed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

/// Specific cause of a [`SignalError::ProtocolViolation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Payload did not parse as any message of the schema.
    Malformed(String),
    /// A required field was absent or had the wrong JSON type.
    MissingField(&'static str),
    /// Multiplexed envelope did not carry exactly one of `offer`/`answer`/`ice`,
    /// or the inner message did not match its key.
    BadEnvelope,
    /// The message is valid but not acceptable in the current state.
    UnexpectedMessage {
        message: &'static str,
        state: NegotiationState,
    },
    /// A second local or remote description was produced in one round.
    DescriptionReused { round: u32 },
    DuplicateCode(RendezvousCode),
    UnknownCode(RendezvousCode),
    /// The rendezvous service answered with a status outside its contract.
    UnexpectedStatus(u16),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed message: {detail}"),
            Self::MissingField(field) => write!(f, "missing or invalid field `{field}`"),
            Self::BadEnvelope => write!(f, "invalid multiplexed envelope"),
            Self::UnexpectedMessage { message, state } => {
                write!(f, "unexpected {message} in state {state:?}")
            }
            Self::DescriptionReused { round } => {
                write!(f, "description already set for round {round}")
            }
            Self::DuplicateCode(code) => write!(f, "rendezvous code {code} already registered"),
            Self::UnknownCode(code) => write!(f, "unknown rendezvous code {code}"),
            Self::UnexpectedStatus(status) => write!(f, "unexpected rendezvous status {status}"),
        }
    }
}

/// Convenience alias for `Result<T, SignalError>`.
pub type Result<T> = std::result::Result<T, SignalError>;
