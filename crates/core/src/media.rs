//! External media collaborators.
//!
//! The signaling core never touches audio or video. It drives a
//! [`MediaEngine`] (the real-time transport stack that produces and
//! consumes descriptions and candidates) and asks a [`MediaSource`] for
//! local tracks. Both are supplied by the embedding application.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{IceCandidate, SessionDescription};

/// Local candidates discovered by an engine, in discovery order.
/// `None` marks the end of gathering for the current round.
pub type CandidateStream = mpsc::UnboundedReceiver<Option<IceCandidate>>;

/// Kind of a local media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to a captured local track. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// The underlying real-time engine for one negotiation session.
///
/// Every method is a suspension point. Errors from description operations
/// are fatal to the session; a rejected candidate is only logged.
pub trait MediaEngine: Send + 'static {
    fn create_offer(&mut self) -> impl Future<Output = Result<SessionDescription>> + Send;

    fn create_answer(&mut self) -> impl Future<Output = Result<SessionDescription>> + Send;

    fn set_local_description(
        &mut self,
        desc: &SessionDescription,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Attach a local track. Takes effect in the next description created.
    fn add_track(&mut self, track: &MediaTrack) -> impl Future<Output = Result<()>> + Send;
}

/// Creates one engine per session, together with its local-candidate stream.
pub trait MediaEngineFactory: Send + Sync + 'static {
    type Engine: MediaEngine;

    fn create(&self) -> Result<(Self::Engine, CandidateStream)>;
}

/// Capture devices. Acquisition may prompt the user for permission, which
/// is why orchestrators defer it until a peer is confirmed.
pub trait MediaSource: Send + 'static {
    /// Returns the captured tracks, or
    /// [`MediaUnavailable`](crate::SignalError::MediaUnavailable).
    fn acquire(&mut self) -> impl Future<Output = Result<Vec<MediaTrack>>> + Send;
}
