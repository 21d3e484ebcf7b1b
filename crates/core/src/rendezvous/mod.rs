//! Rendezvous service: pairs one host with many clients.
//!
//! ## HTTP contract
//!
//! | Request | Success | Failure |
//! |---------|---------|---------|
//! | `POST /api/host` | `201`, body = host code | `401` host already registered |
//! | `POST /api/client`, body = offer | `201`, `{"sdp":<answer>,"code":<client code>}` | `404` no host connected |
//! | `GET /ws/host?code=` | `101` upgrade | `404` wrong code, `400` bad handshake |
//! | `GET /ws/client?code=` | `101` upgrade | `404` unknown or used code |
//!
//! [`RendezvousClient`] consumes this contract; [`RendezvousServer`] is a
//! reference implementation that relays traffic between the single host
//! channel (code-tagged) and each client channel (untagged).

pub mod client;
mod matchmaker;
pub mod server;

pub use client::RendezvousClient;
pub use server::RendezvousServer;

pub const HOST_PATH: &str = "/api/host";
pub const CLIENT_PATH: &str = "/api/client";
pub const HOST_CHANNEL_PATH: &str = "/ws/host";
pub const CLIENT_CHANNEL_PATH: &str = "/ws/client";
