use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::{CodedMessage, HostEvent, RendezvousCode, SignalingMessage};
use crate::transport::ChannelSender;

/// Draws before giving up on finding an unused client code.
const MINT_ATTEMPTS: usize = 64;

/// The single host slot.
struct HostSlot {
    code: RendezvousCode,
    /// Set once `/ws/host` has been claimed.
    claimed: bool,
    channel: Option<ChannelSender>,
    /// `POST /api/client` requests waiting for the host's answer.
    pending: HashMap<RendezvousCode, oneshot::Sender<String>>,
}

struct ClientSlot {
    claimed: bool,
    channel: Option<ChannelSender>,
    /// Host traffic that arrived before the client channel opened.
    backlog: Vec<SignalingMessage>,
}

#[derive(Default)]
struct Inner {
    host: Option<HostSlot>,
    clients: HashMap<RendezvousCode, ClientSlot>,
}

/// Pairing state of the reference server.
///
/// Every operation takes the lock once and never suspends while holding
/// it. Relaying only enqueues onto channel senders, so the order in which
/// the lock is taken is the order messages leave.
pub(crate) struct Matchmaker {
    code_len: usize,
    inner: Mutex<Inner>,
}

impl Matchmaker {
    pub(crate) fn new(code_len: usize) -> Self {
        Self {
            code_len,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Claim the host slot. `None` if a host already holds it.
    pub(crate) fn register_host(&self) -> Option<RendezvousCode> {
        let mut inner = self.inner.lock();
        if inner.host.is_some() {
            return None;
        }
        let code = RendezvousCode::mint(self.code_len);
        inner.host = Some(HostSlot {
            code: code.clone(),
            claimed: false,
            channel: None,
            pending: HashMap::new(),
        });
        tracing::info!(%code, "host registered");
        Some(code)
    }

    pub(crate) fn claim_host_channel(&self, code: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.host.as_mut() {
            Some(host) if host.code.as_str() == code && !host.claimed => {
                host.claimed = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn attach_host(&self, code: &RendezvousCode, channel: ChannelSender) {
        let mut inner = self.inner.lock();
        match inner.host.as_mut() {
            Some(host) if &host.code == code => {
                host.channel = Some(channel);
                tracing::info!(%code, "host channel open");
            }
            _ => channel.close(),
        }
    }

    /// Release a registration whose `/ws/host` was never claimed.
    pub(crate) fn expire_host(&self, code: &RendezvousCode) {
        let mut inner = self.inner.lock();
        if inner
            .host
            .as_ref()
            .is_some_and(|host| &host.code == code && !host.claimed)
        {
            inner.host = None;
            inner.clients.clear();
            tracing::warn!(%code, "host registration expired unclaimed");
        }
    }

    /// Drop the host and every client paired through it.
    pub(crate) fn release_host(&self, code: &RendezvousCode) {
        let mut inner = self.inner.lock();
        if inner.host.as_ref().is_none_or(|host| &host.code != code) {
            return;
        }
        inner.host = None;
        for (_, client) in inner.clients.drain() {
            if let Some(channel) = client.channel {
                channel.close();
            }
        }
        tracing::info!(%code, "host released");
    }

    /// Forward a client offer to the connected host. `None` if no host
    /// channel is open or no unused code could be found. The receiver
    /// resolves with the host's answer.
    pub(crate) fn request_pairing(
        &self,
        offer_sdp: String,
    ) -> Option<(RendezvousCode, oneshot::Receiver<String>)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let host = inner.host.as_mut()?;
        let channel = host.channel.as_ref()?;

        let minted = (0..MINT_ATTEMPTS)
            .map(|_| RendezvousCode::mint(self.code_len))
            .find(|candidate| {
                candidate != &host.code
                    && !inner.clients.contains_key(candidate)
                    && !host.pending.contains_key(candidate)
            });
        let Some(code) = minted else {
            tracing::warn!(
                clients = inner.clients.len(),
                code_len = self.code_len,
                "no unused pairing code left"
            );
            return None;
        };

        let offer = CodedMessage::new(code.clone(), SignalingMessage::Offer { sdp: offer_sdp });
        if let Err(e) = channel.send(&offer) {
            tracing::warn!(error = %e, "host channel refused offer");
            return None;
        }

        let (answer_tx, answer_rx) = oneshot::channel();
        host.pending.insert(code.clone(), answer_tx);
        inner.clients.insert(
            code.clone(),
            ClientSlot {
                claimed: false,
                channel: None,
                backlog: Vec::new(),
            },
        );
        tracing::debug!(%code, "offer forwarded to host");
        Some((code, answer_rx))
    }

    /// Traffic from the host channel.
    pub(crate) fn from_host(&self, message: CodedMessage) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let CodedMessage { code, message } = message;

        if let SignalingMessage::Answer { sdp } = &message {
            let waiter = inner
                .host
                .as_mut()
                .and_then(|host| host.pending.remove(&code));
            if let Some(waiter) = waiter {
                if waiter.send(sdp.clone()).is_err() {
                    tracing::debug!(%code, "pairing request gone before answer");
                    inner.clients.remove(&code);
                    notify_left(inner, &code);
                }
                return;
            }
        }

        let Some(client) = inner.clients.get_mut(&code) else {
            tracing::warn!(%code, message = message.label(), "host message for unknown client dropped");
            return;
        };
        match &client.channel {
            Some(channel) => {
                if let Err(e) = channel.send(&message) {
                    tracing::debug!(%code, error = %e, "client channel gone");
                }
            }
            None => client.backlog.push(message),
        }
    }

    /// Claim `/ws/client` for `code`. Each code opens at most once.
    pub(crate) fn claim_client_channel(&self, code: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.clients.get_mut(code) {
            Some(client) if !client.claimed => {
                client.claimed = true;
                true
            }
            _ => false,
        }
    }

    /// Attach the client channel and flush anything the host already sent.
    pub(crate) fn attach_client(&self, code: &RendezvousCode, channel: ChannelSender) {
        let mut inner = self.inner.lock();
        let Some(client) = inner.clients.get_mut(code) else {
            channel.close();
            return;
        };
        for message in client.backlog.drain(..) {
            if channel.send(&message).is_err() {
                break;
            }
        }
        client.channel = Some(channel);
        tracing::info!(%code, "client channel open");
    }

    /// Traffic from a client channel. `false` once the host is gone.
    pub(crate) fn from_client(&self, code: &RendezvousCode, message: SignalingMessage) -> bool {
        let inner = self.inner.lock();
        let Some(channel) = inner.host.as_ref().and_then(|host| host.channel.as_ref()) else {
            return false;
        };
        channel
            .send(&CodedMessage::new(code.clone(), message))
            .is_ok()
    }

    /// Drop a client and tell the host its session is over.
    pub(crate) fn release_client(&self, code: &RendezvousCode) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(host) = inner.host.as_mut() {
            host.pending.remove(code);
        }
        if inner.clients.remove(code).is_some() {
            tracing::debug!(%code, "client released");
            notify_left(inner, code);
        }
    }

    /// Release a paired client whose `/ws/client` was never claimed.
    pub(crate) fn expire_client(&self, code: &RendezvousCode) {
        let mut inner = self.inner.lock();
        if inner.clients.get(code).is_some_and(|client| !client.claimed) {
            inner.clients.remove(code);
            tracing::warn!(%code, "client pairing expired unclaimed");
            notify_left(&inner, code);
        }
    }

    pub(crate) fn has_host(&self) -> bool {
        self.inner.lock().host.is_some()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }
}

fn notify_left(inner: &Inner, code: &RendezvousCode) {
    if let Some(channel) = inner.host.as_ref().and_then(|host| host.channel.as_ref()) {
        let _ = channel.send(&HostEvent::ClientLeft(code.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IceCandidate;
    use crate::transport::memory;

    #[test]
    fn one_host_at_a_time() {
        let mm = Matchmaker::new(4);
        let code = mm.register_host().unwrap();
        assert_eq!(code.as_str().len(), 4);
        assert!(mm.register_host().is_none());

        mm.release_host(&code);
        assert!(mm.register_host().is_some());
    }

    #[test]
    fn host_channel_needs_matching_unclaimed_code() {
        let mm = Matchmaker::new(4);
        let code = mm.register_host().unwrap();
        assert!(!mm.claim_host_channel("nope"));
        assert!(mm.claim_host_channel(code.as_str()));
        assert!(!mm.claim_host_channel(code.as_str()));
    }

    #[test]
    fn no_pairing_without_host_channel() {
        let mm = Matchmaker::new(4);
        assert!(mm.request_pairing("v=0".to_string()).is_none());
        mm.register_host().unwrap();
        assert!(mm.request_pairing("v=0".to_string()).is_none());
    }

    #[tokio::test]
    async fn relays_between_host_and_client() {
        let mm = Matchmaker::new(4);
        let host_code = mm.register_host().unwrap();
        let (host_side, mut host_peer) = memory::pair("server", "host");
        mm.attach_host(&host_code, host_side.sender());

        let (client_code, answer_rx) = mm.request_pairing("offer-sdp".to_string()).unwrap();
        let offer: CodedMessage = host_peer.recv().await.unwrap().unwrap();
        assert_eq!(offer.code, client_code);

        // Host answers, then trickles before the client channel exists.
        mm.from_host(CodedMessage::new(
            client_code.clone(),
            SignalingMessage::Answer {
                sdp: "answer-sdp".to_string(),
            },
        ));
        let ice = SignalingMessage::Candidate(Some(IceCandidate::new("candidate:h")));
        mm.from_host(CodedMessage::new(client_code.clone(), ice.clone()));
        assert_eq!(answer_rx.await.unwrap(), "answer-sdp");

        assert!(mm.claim_client_channel(client_code.as_str()));
        assert!(!mm.claim_client_channel(client_code.as_str()));
        let (client_side, mut client_peer) = memory::pair("server", "client");
        mm.attach_client(&client_code, client_side.sender());
        let backlog: SignalingMessage = client_peer.recv().await.unwrap().unwrap();
        assert_eq!(backlog, ice);

        let reply = SignalingMessage::Candidate(None);
        assert!(mm.from_client(&client_code, reply.clone()));
        let tagged: CodedMessage = host_peer.recv().await.unwrap().unwrap();
        assert_eq!(tagged, CodedMessage::new(client_code.clone(), reply));

        mm.release_host(&host_code);
        assert!(!mm.has_host());
        assert_eq!(mm.client_count(), 0);
        assert!(client_peer.recv_text().await.is_none());
    }

    #[test]
    fn pairing_gives_up_when_codes_run_out() {
        // One-symbol codes: the host holds one, 35 remain for clients.
        let mm = Matchmaker::new(1);
        let host_code = mm.register_host().unwrap();
        let (host_side, _host_peer) = memory::pair("server", "host");
        mm.attach_host(&host_code, host_side.sender());

        let paired = (0..40)
            .filter(|_| mm.request_pairing("v=0".to_string()).is_some())
            .count();
        assert!(paired <= 35);
        assert_eq!(mm.client_count(), paired);
    }

    #[test]
    fn unclaimed_host_registration_expires() {
        let mm = Matchmaker::new(4);
        let stale = mm.register_host().unwrap();
        mm.expire_host(&stale);
        assert!(!mm.has_host());

        let code = mm.register_host().unwrap();
        assert!(mm.claim_host_channel(code.as_str()));
        mm.expire_host(&code);
        assert!(mm.has_host(), "a claimed host is not expired");
        // A stale timer for an older registration leaves the new one alone.
        mm.expire_host(&stale);
        assert!(mm.has_host());
    }

    #[tokio::test]
    async fn host_learns_when_a_client_goes_away() {
        let mm = Matchmaker::new(4);
        let host_code = mm.register_host().unwrap();
        let (host_side, mut host_peer) = memory::pair("server", "host");
        mm.attach_host(&host_code, host_side.sender());

        let (abandoned, _rx) = mm.request_pairing("offer-a".to_string()).unwrap();
        let (connected, _rx) = mm.request_pairing("offer-b".to_string()).unwrap();
        for _ in 0..2 {
            let event: HostEvent = host_peer.recv().await.unwrap().unwrap();
            assert!(matches!(event, HostEvent::Relay(_)));
        }

        assert!(mm.claim_client_channel(connected.as_str()));
        mm.expire_client(&connected);
        mm.expire_client(&abandoned);
        assert_eq!(mm.client_count(), 1);
        let event: HostEvent = host_peer.recv().await.unwrap().unwrap();
        assert_eq!(event, HostEvent::ClientLeft(abandoned));

        mm.release_client(&connected);
        assert_eq!(mm.client_count(), 0);
        let event: HostEvent = host_peer.recv().await.unwrap().unwrap();
        assert_eq!(event, HostEvent::ClientLeft(connected));
    }
}
