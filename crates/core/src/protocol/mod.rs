//! Signaling message schema.
//!
//! Every message is one JSON object. Two framings exist:
//!
//! - **Direct** ([`SignalingMessage`]): used on a channel that carries a
//!   single pairing (client channels, the persistent direct-connect
//!   channel).
//! - **Multiplexed** ([`CodedMessage`]): used on the host channel, where one
//!   socket carries every client. Each message is tagged with the client's
//!   [`RendezvousCode`].
//!
//! ## Messages
//!
//! | Message | Direct form | Multiplexed key |
//! |---------|-------------|-----------------|
//! | Offer | `{"type":"offer","sdp":..}` | `offer` |
//! | Answer | `{"type":"answer","sdp":..}` | `answer` |
//! | Candidate | `{"candidate":..,"sdpMid":..,"sdpMLineIndex":..}` | `ice` |
//! | Client left | (none) | `left` (service to host only) |
//!
//! Decoding is strict. Anything that does not match the schema is a
//! [`ProtocolViolation`](crate::SignalError::ProtocolViolation), and the
//! channel that delivered it is closed.

pub mod envelope;
pub mod message;

pub use envelope::{CodedMessage, DEFAULT_CODE_LEN, HostEvent, Pairing, RendezvousCode};
pub use message::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};

/// A message type with a textual wire encoding.
pub trait WireMessage: Sized {
    fn encode(&self) -> String;
    fn decode(text: &str) -> crate::Result<Self>;
}

impl WireMessage for SignalingMessage {
    fn encode(&self) -> String {
        SignalingMessage::encode(self)
    }

    fn decode(text: &str) -> crate::Result<Self> {
        SignalingMessage::decode(text)
    }
}

impl WireMessage for CodedMessage {
    fn encode(&self) -> String {
        CodedMessage::encode(self)
    }

    fn decode(text: &str) -> crate::Result<Self> {
        CodedMessage::decode(text)
    }
}

impl WireMessage for HostEvent {
    fn encode(&self) -> String {
        HostEvent::encode(self)
    }

    fn decode(text: &str) -> crate::Result<Self> {
        HostEvent::decode(text)
    }
}
