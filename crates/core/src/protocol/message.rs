use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SignalError, ViolationKind};

/// Which half of a negotiation round a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description together with its role in the round.
///
/// The SDP body is never inspected here; codec content is the media
/// engine's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled connectivity candidate, in the browser `toJSON()` shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }
}

/// One signaling message, as exchanged with a rendezvous peer.
///
/// ## Wire format
///
/// ```text
/// {"type":"offer","sdp":"v=0..."}
/// {"type":"answer","sdp":"v=0..."}
/// {"candidate":"candidate:1 1 udp ...","sdpMid":"0","sdpMLineIndex":0}
/// {"candidate":null}
/// ```
///
/// A candidate message is recognised by the absence of `type`. A `null`
/// or empty `candidate` is the end-of-candidates marker and decodes to
/// `Candidate(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(Option<IceCandidate>),
}

impl SignalingMessage {
    /// Short name used in logs and violation reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(Some(_)) => "candidate",
            Self::Candidate(None) => "end-of-candidates",
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let wire: DirectWire = serde_json::from_str(text).map_err(malformed)?;
        match wire {
            DirectWire::Description(desc) => desc.into_message(),
            DirectWire::Candidate(candidate) => Ok(candidate.into_message()),
        }
    }

    pub fn encode(&self) -> String {
        let wire = match self {
            Self::Offer { sdp } => DirectWire::Description(Description::Offer { sdp: sdp.clone() }),
            Self::Answer { sdp } => DirectWire::Description(Description::Answer { sdp: sdp.clone() }),
            Self::Candidate(candidate) => DirectWire::Candidate(candidate.as_ref().into()),
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

impl From<SessionDescription> for SignalingMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Self::Offer { sdp: desc.sdp },
            SdpKind::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

pub(super) fn malformed(e: serde_json::Error) -> SignalError {
    SignalError::violation(ViolationKind::Malformed(e.to_string()))
}

/// A direct-framed message. No `type` means a candidate.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DirectWire {
    Description(Description),
    Candidate(CandidateWire),
}

/// An offer or answer on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(super) enum Description {
    Offer { sdp: String },
    Answer { sdp: String },
}

impl Description {
    pub(super) fn into_message(self) -> Result<SignalingMessage> {
        match self {
            Self::Offer { sdp } | Self::Answer { sdp } if sdp.is_empty() => {
                Err(SignalError::violation(ViolationKind::MissingField("sdp")))
            }
            Self::Offer { sdp } => Ok(SignalingMessage::Offer { sdp }),
            Self::Answer { sdp } => Ok(SignalingMessage::Answer { sdp }),
        }
    }
}

/// A candidate on the wire. `candidate` must be present; `null` or `""`
/// ends the round.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct CandidateWire {
    #[serde(deserialize_with = "required_nullable")]
    candidate: Option<String>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    username_fragment: Option<String>,
}

impl CandidateWire {
    pub(super) fn into_message(self) -> SignalingMessage {
        match self.candidate {
            Some(candidate) if !candidate.is_empty() => {
                SignalingMessage::Candidate(Some(IceCandidate {
                    candidate,
                    sdp_mid: self.sdp_mid,
                    sdp_m_line_index: self.sdp_m_line_index,
                    username_fragment: self.username_fragment,
                }))
            }
            _ => SignalingMessage::Candidate(None),
        }
    }
}

impl From<Option<&IceCandidate>> for CandidateWire {
    fn from(candidate: Option<&IceCandidate>) -> Self {
        match candidate {
            Some(c) => Self {
                candidate: Some(c.candidate.clone()),
                sdp_mid: c.sdp_mid.clone(),
                sdp_m_line_index: c.sdp_m_line_index,
                username_fragment: c.username_fragment.clone(),
            },
            None => Self {
                candidate: None,
                sdp_mid: None,
                sdp_m_line_index: None,
                username_fragment: None,
            },
        }
    }
}

/// Like a plain `Option` field, except that a missing key is an error
/// rather than `None`.
fn required_nullable<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<String>, D::Error> {
    Option::<String>::deserialize(de)
}
