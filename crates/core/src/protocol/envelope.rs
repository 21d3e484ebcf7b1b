use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::message::{CandidateWire, Description, SignalingMessage, malformed};
use crate::error::{Result, SignalError, ViolationKind};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default length of codes minted by [`RendezvousCode::mint`].
pub const DEFAULT_CODE_LEN: usize = 4;

/// Short-lived token pairing one host session with one client session.
///
/// Codes are opaque to everything except the rendezvous service that mints
/// them; the rest of the crate only compares them for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendezvousCode(String);

impl RendezvousCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Mint a random uppercase alphanumeric code (e.g. `H7Q2`).
    pub fn mint(len: usize) -> Self {
        let code = (0..len.max(1))
            .map(|_| CODE_ALPHABET[rand::random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RendezvousCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RendezvousCode {
    fn from(code: &str) -> Self {
        Self(code.to_string())
    }
}

impl Borrow<str> for RendezvousCode {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A [`SignalingMessage`] tagged with the pairing it belongs to.
///
/// Used on the single host channel that multiplexes every client:
///
/// ```text
/// {"code":"C1","offer":{"type":"offer","sdp":"..."}}
/// {"code":"C1","answer":{"type":"answer","sdp":"..."}}
/// {"code":"C1","ice":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0}}
/// ```
///
/// Exactly one of `offer`, `answer` or `ice` must be present, and the inner
/// message must be of the kind its key names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedMessage {
    pub code: RendezvousCode,
    pub message: SignalingMessage,
}

impl CodedMessage {
    pub fn new(code: RendezvousCode, message: SignalingMessage) -> Self {
        Self { code, message }
    }

    pub fn encode(&self) -> String {
        EnvelopeWire::relay(self).encode()
    }

    pub fn decode(text: &str) -> Result<Self> {
        match EnvelopeWire::parse(text)? {
            HostEvent::Relay(message) => Ok(message),
            HostEvent::ClientLeft(_) => Err(SignalError::violation(ViolationKind::BadEnvelope)),
        }
    }
}

/// What the rendezvous service sends down the host channel: relayed client
/// traffic, or notice that a client's channel is gone.
///
/// ```text
/// {"code":"C1","left":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Relay(CodedMessage),
    ClientLeft(RendezvousCode),
}

impl HostEvent {
    pub fn encode(&self) -> String {
        match self {
            Self::Relay(message) => message.encode(),
            Self::ClientLeft(code) => EnvelopeWire {
                code: code.clone(),
                offer: None,
                answer: None,
                ice: None,
                left: true,
            }
            .encode(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        EnvelopeWire::parse(text)
    }
}

#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    code: RendezvousCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice: Option<CandidateWire>,
    #[serde(default, skip_serializing_if = "is_false")]
    left: bool,
}

impl EnvelopeWire {
    fn relay(coded: &CodedMessage) -> Self {
        let mut wire = Self {
            code: coded.code.clone(),
            offer: None,
            answer: None,
            ice: None,
            left: false,
        };
        match &coded.message {
            SignalingMessage::Offer { sdp } => wire.offer = Some(Description::Offer { sdp: sdp.clone() }),
            SignalingMessage::Answer { sdp } => {
                wire.answer = Some(Description::Answer { sdp: sdp.clone() })
            }
            SignalingMessage::Candidate(candidate) => wire.ice = Some(candidate.as_ref().into()),
        }
        wire
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn parse(text: &str) -> Result<HostEvent> {
        let wire: Self = serde_json::from_str(text).map_err(malformed)?;
        let Self {
            code,
            offer,
            answer,
            ice,
            left,
        } = wire;
        if code.as_str().is_empty() {
            return Err(SignalError::violation(ViolationKind::MissingField("code")));
        }

        let message = match (offer, answer, ice, left) {
            (Some(desc @ Description::Offer { .. }), None, None, false)
            | (None, Some(desc @ Description::Answer { .. }), None, false) => desc.into_message()?,
            (None, None, Some(candidate), false) => candidate.into_message(),
            (None, None, None, true) => return Ok(HostEvent::ClientLeft(code)),
            _ => return Err(SignalError::violation(ViolationKind::BadEnvelope)),
        };
        Ok(HostEvent::Relay(CodedMessage { code, message }))
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Body of a successful `POST /api/client`: the host's answer plus the
/// pairing code scoped to this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    pub sdp: String,
    pub code: RendezvousCode,
}
