//! Signaling transport: a reliable, ordered, bidirectional message channel
//! to a rendezvous peer.
//!
//! Two concrete backings share the same [`SignalingChannel`] front:
//!
//! - **WebSocket** ([`ws`]): a socket to the rendezvous service (client
//!   side) or accepted from a peer (server side). Reader and writer pumps
//!   run as tasks; the channel talks to them through queues.
//!
//! - **Memory** ([`memory`]): two channels wired back to back in-process.
//!
//! Sending only enqueues, so a send never suspends and messages leave in
//! send order. Inbound messages are handed out strictly in receipt order.

pub mod memory;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::{Result, SignalError};
use crate::protocol::WireMessage;

/// Unit of traffic between a channel and its backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Text(String),
    Close,
}

/// Cloneable sending half of a [`SignalingChannel`].
///
/// Handed to the tasks that produce outbound traffic (session drivers,
/// relays) while the channel itself stays with the single reader.
#[derive(Clone)]
pub struct ChannelSender {
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    peer: Arc<str>,
}

impl ChannelSender {
    /// Enqueue a raw text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(SignalError::ChannelUnavailable(format!(
                "channel to {} is closed",
                self.peer
            )));
        }
        tracing::trace!(peer = %self.peer, len = text.len(), "send");
        self.outbound
            .send(Frame::Text(text))
            .map_err(|_| SignalError::ChannelUnavailable(format!("{} went away", self.peer)))
    }

    pub fn send<M: WireMessage>(&self, message: &M) -> Result<()> {
        self.send_text(message.encode())
    }

    /// Close the channel. Idempotent; only the first call notifies the peer.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Frame::Close);
            tracing::debug!(peer = %self.peer, "channel closed locally");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// A signaling channel to one rendezvous peer.
pub struct SignalingChannel {
    sender: ChannelSender,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl SignalingChannel {
    pub(crate) fn from_parts(
        peer: &str,
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            sender: ChannelSender {
                outbound,
                closed: Arc::new(AtomicBool::new(false)),
                peer: Arc::from(peer),
            },
            inbound,
        }
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn send<M: WireMessage>(&self, message: &M) -> Result<()> {
        self.sender.send(message)
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        self.sender.send_text(text)
    }

    /// Next raw text frame, or `None` once the channel is closed from
    /// either side.
    pub async fn recv_text(&mut self) -> Option<String> {
        if self.sender.is_closed() {
            return None;
        }
        match self.inbound.recv().await {
            Some(Frame::Text(text)) => {
                tracing::trace!(peer = %self.sender.peer, len = text.len(), "recv");
                Some(text)
            }
            Some(Frame::Close) | None => {
                self.sender.closed.store(true, Ordering::SeqCst);
                tracing::debug!(peer = %self.sender.peer, "channel closed by peer");
                None
            }
        }
    }

    /// Next decoded message, or `Ok(None)` once closed.
    ///
    /// A frame that fails schema validation closes the channel before the
    /// violation is returned; nothing further is read from that peer.
    pub async fn recv<M: WireMessage>(&mut self) -> Result<Option<M>> {
        let Some(text) = self.recv_text().await else {
            return Ok(None);
        };
        match M::decode(&text) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                tracing::warn!(peer = %self.sender.peer, error = %e, "closing channel after malformed message");
                self.sender.close();
                Err(e)
            }
        }
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn peer(&self) -> &str {
        self.sender.peer()
    }
}
