//! Role and policy configuration.
//!
//! Plain structs with sensible defaults. Nothing here is loaded from disk;
//! the embedding application builds them directly.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SignalError};
use crate::protocol::DEFAULT_CODE_LEN;
use crate::session::Role;

/// Per-session negotiation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// Send locally discovered candidates as soon as the local description
    /// of the current round is committed. When `false`, they are held until
    /// the session reaches `Connected`.
    pub early_trickle: bool,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            early_trickle: true,
        }
    }
}

impl NegotiationPolicy {
    pub fn conservative() -> Self {
        Self {
            early_trickle: false,
        }
    }
}

/// How a client reaches its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelShape {
    /// One duplex channel, opened before negotiation, carries everything.
    /// `endpoint` is a `ws://` URL supplied by the caller.
    Persistent { endpoint: String },
    /// Offer/answer over `POST /api/client`, then a channel scoped to the
    /// returned code for trickling. `base_url` is the rendezvous service,
    /// e.g. `http://127.0.0.1:3000`.
    RequestResponse { base_url: String },
}

/// Client orchestrator configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub shape: ChannelShape,
    /// Only consulted for [`ChannelShape::Persistent`]; request/response
    /// clients always offer.
    pub role: Role,
    pub policy: NegotiationPolicy,
    /// Acquire media before the first offer instead of after the remote
    /// description is committed.
    pub media_up_front: bool,
    /// First frame sent on a persistent channel, e.g. a join token.
    pub initial_payload: Option<String>,
    /// Bounds channel open. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn request_response(base_url: impl Into<String>) -> Self {
        Self {
            shape: ChannelShape::RequestResponse {
                base_url: base_url.into(),
            },
            role: Role::Offerer,
            policy: NegotiationPolicy::default(),
            media_up_front: false,
            initial_payload: None,
            connect_timeout: None,
        }
    }

    pub fn persistent(endpoint: impl Into<String>, role: Role) -> Self {
        Self {
            shape: ChannelShape::Persistent {
                endpoint: endpoint.into(),
            },
            role,
            policy: NegotiationPolicy::default(),
            media_up_front: false,
            initial_payload: None,
            connect_timeout: None,
        }
    }

    /// Role the client session actually takes.
    pub fn effective_role(&self) -> Role {
        match self.shape {
            ChannelShape::Persistent { .. } => self.role,
            ChannelShape::RequestResponse { .. } => Role::Offerer,
        }
    }
}

/// Host orchestrator configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Rendezvous service base URL.
    pub rendezvous_url: String,
    pub policy: NegotiationPolicy,
    pub connect_timeout: Option<Duration>,
}

impl HostConfig {
    pub fn new(rendezvous_url: impl Into<String>) -> Self {
        Self {
            rendezvous_url: rendezvous_url.into(),
            policy: NegotiationPolicy::default(),
            connect_timeout: None,
        }
    }
}

/// Shortest pairing code the reference server accepts.
pub const MIN_CODE_LEN: usize = 3;

/// Reference rendezvous server configuration.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub bind_addr: SocketAddr,
    /// Length of minted pairing codes.
    pub code_len: usize,
    /// How long a registered host, or a paired client, may take to open its
    /// channel before the slot is released.
    pub claim_timeout: Duration,
}

impl RendezvousConfig {
    pub fn validate(&self) -> Result<()> {
        if self.code_len < MIN_CODE_LEN {
            return Err(SignalError::Config(format!(
                "code length {} is below the minimum of {MIN_CODE_LEN}",
                self.code_len
            )));
        }
        if self.claim_timeout.is_zero() {
            return Err(SignalError::Config("claim timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            code_len: DEFAULT_CODE_LEN,
            claim_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_clients_always_offer() {
        let mut config = ClientConfig::request_response("http://localhost:3000");
        config.role = Role::Answerer;
        assert_eq!(config.effective_role(), Role::Offerer);

        let config = ClientConfig::persistent("ws://localhost:3000/ws", Role::Answerer);
        assert_eq!(config.effective_role(), Role::Answerer);
    }

    #[test]
    fn defaults() {
        assert!(NegotiationPolicy::default().early_trickle);
        assert!(!NegotiationPolicy::conservative().early_trickle);
        let server = RendezvousConfig::default();
        assert_eq!(server.bind_addr.port(), 3000);
        assert_eq!(server.code_len, 4);
        assert!(server.validate().is_ok());
    }

    #[test]
    fn short_codes_are_rejected() {
        let config = RendezvousConfig {
            code_len: 2,
            ..RendezvousConfig::default()
        };
        assert!(matches!(config.validate(), Err(SignalError::Config(_))));

        let config = RendezvousConfig {
            claim_timeout: Duration::ZERO,
            ..RendezvousConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
