pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod transport;

pub use config::{ChannelShape, ClientConfig, HostConfig, NegotiationPolicy, RendezvousConfig};
pub use error::{Result, SignalError, ViolationKind};
pub use media::{CandidateStream, MediaEngine, MediaEngineFactory, MediaSource, MediaTrack, TrackKind};
pub use orchestrator::{ClientSession, HostHandle};
pub use protocol::{CodedMessage, HostEvent, IceCandidate, Pairing, RendezvousCode, SessionDescription, SignalingMessage};
pub use registry::{SessionHandle, SessionRegistry};
pub use rendezvous::{RendezvousClient, RendezvousServer};
pub use session::{NegotiationState, Role, Session, Trigger};
pub use transport::{ChannelSender, SignalingChannel};
