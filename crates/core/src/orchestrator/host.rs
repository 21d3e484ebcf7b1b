use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{HostConfig, NegotiationPolicy};
use crate::error::Result;
use crate::media::{CandidateStream, MediaEngine, MediaEngineFactory, MediaSource, MediaTrack};
use crate::protocol::{CodedMessage, HostEvent, RendezvousCode, SignalingMessage};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::rendezvous::RendezvousClient;
use crate::session::{NegotiationState, Role, Session, Trigger};
use crate::transport::{ChannelSender, SignalingChannel, ws};

/// A registered host.
///
/// Every client offer that arrives on the host channel gets its own
/// answering [`Session`], keyed by the client's code in the
/// [`SessionRegistry`]. Sessions run concurrently on their own tasks and
/// share nothing but the registry.
pub struct HostHandle {
    code: RendezvousCode,
    registry: SessionRegistry,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl HostHandle {
    /// Acquire media, register with the rendezvous service and open the
    /// host channel.
    pub async fn start<F, S>(config: HostConfig, factory: F, mut source: S) -> Result<Self>
    where
        F: MediaEngineFactory,
        S: MediaSource,
    {
        let tracks = source.acquire().await?;
        tracing::info!(count = tracks.len(), "host media acquired");

        let rendezvous = RendezvousClient::new(&config.rendezvous_url)?;
        let code = rendezvous.register_host().await?;
        let url = rendezvous.host_channel_url(&code)?;
        let channel = ws::connect(&url, None, config.connect_timeout).await?;

        let registry = SessionRegistry::new();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let dispatcher = Dispatcher {
            registry: registry.clone(),
            factory,
            tracks,
            policy: config.policy,
            sender: channel.sender(),
        };
        let task = tokio::spawn(dispatcher.run(channel, shutdown_rx));

        tracing::info!(%code, "host ready");
        Ok(Self {
            code,
            registry,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn code(&self) -> &RendezvousCode {
        &self.code
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Close the host channel; every session ends `Closed`. Dropping the
    /// handle has the same effect.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Wait for the host channel to end.
    pub async fn join(self) -> Result<()> {
        super::join_task(self.task).await
    }
}

struct Dispatcher<F> {
    registry: SessionRegistry,
    factory: F,
    tracks: Vec<MediaTrack>,
    policy: NegotiationPolicy,
    sender: ChannelSender,
}

impl<F: MediaEngineFactory> Dispatcher<F> {
    async fn run(self, mut channel: SignalingChannel, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let outcome = loop {
            tokio::select! {
                received = channel.recv::<HostEvent>() => match received {
                    Ok(Some(HostEvent::Relay(CodedMessage { code, message }))) => {
                        self.dispatch(code, message)
                    }
                    Ok(Some(HostEvent::ClientLeft(code))) => self.client_left(&code),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = &mut shutdown => {
                    channel.close();
                    break Ok(());
                }
            }
        };

        let notified = self.registry.close_all();
        match &outcome {
            Ok(()) => tracing::info!(sessions = notified, "host channel closed"),
            Err(e) => tracing::error!(sessions = notified, error = %e, "host channel failed"),
        }
        outcome
    }

    fn dispatch(&self, code: RendezvousCode, message: SignalingMessage) {
        if !self.registry.contains(&code) {
            if let SignalingMessage::Offer { .. } = message {
                if let Err(e) = self.spawn_session(code.clone()) {
                    tracing::error!(%code, error = %e, "could not create session");
                    return;
                }
            }
        }

        // Unknown codes are dropped here; the channel stays up.
        if let Err(e) = self.registry.route(&code, message) {
            tracing::warn!(%code, error = %e, "dropping message");
        }
    }

    fn client_left(&self, code: &RendezvousCode) {
        if self.registry.close(code) {
            tracing::info!(%code, "client left, closing session");
        } else {
            tracing::debug!(%code, "client left before a session existed");
        }
    }

    fn spawn_session(&self, code: RendezvousCode) -> Result<()> {
        let (engine, candidates) = self.factory.create()?;
        let mut session = Session::new(code.to_string(), Role::Answerer, self.policy, engine);
        session.await_offer()?;

        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(triggers, session.subscribe());
        self.registry.register(code.clone(), handle.clone())?;

        // Tracks are queued ahead of the offer so they are part of the answer.
        for track in &self.tracks {
            handle.send(Trigger::AddTrack(track.clone()));
        }

        tokio::spawn(run_session(
            session,
            code,
            trigger_rx,
            candidates,
            self.sender.clone(),
            self.registry.clone(),
        ));
        Ok(())
    }
}

async fn run_session<E: MediaEngine>(
    mut session: Session<E>,
    code: RendezvousCode,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut candidates: CandidateStream,
    sender: ChannelSender,
    registry: SessionRegistry,
) {
    loop {
        let trigger = tokio::select! {
            trigger = triggers.recv() => trigger.unwrap_or(Trigger::ChannelClosed),
            Some(candidate) = candidates.recv() => Trigger::LocalCandidate(candidate),
        };

        let mut result = session.handle(trigger).await;
        if result.is_ok() && session.state() == NegotiationState::OfferReceived {
            result = session.answer().await.map_err(|e| session.fail(e));
        }

        for message in session.poll_output() {
            if let Err(e) = sender.send(&CodedMessage::new(code.clone(), message)) {
                tracing::debug!(%code, error = %e, "host channel gone");
                break;
            }
        }

        if let Err(e) = result {
            tracing::warn!(%code, error = %e, "client session ended with error");
        }
        if session.state().is_terminal() {
            break;
        }
    }
    registry.unregister(&code);
}

