use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{ChannelShape, ClientConfig};
use crate::error::{Result, SignalError};
use crate::media::{CandidateStream, MediaEngine, MediaEngineFactory, MediaSource, MediaTrack};
use crate::protocol::{RendezvousCode, SignalingMessage};
use crate::rendezvous::RendezvousClient;
use crate::session::{NegotiationState, Role, Session, Trigger};
use crate::transport::{ChannelSender, SignalingChannel, ws};

enum Command {
    Trigger(Trigger),
    Close,
}

/// A running client-side negotiation.
///
/// Returned once the signaling channel is open and the first round is
/// under way. The session itself runs on a background task.
pub struct ClientSession {
    code: Option<RendezvousCode>,
    state: watch::Receiver<NegotiationState>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<Result<()>>,
}

impl ClientSession {
    /// Open the signaling channel described by `config` and start
    /// negotiating.
    ///
    /// Media is taken from `source` either before the first offer
    /// (`media_up_front`) or once the remote description is committed.
    pub async fn connect<F, S>(config: ClientConfig, factory: &F, mut source: S) -> Result<Self>
    where
        F: MediaEngineFactory,
        S: MediaSource,
    {
        let (engine, local_candidates) = factory.create()?;
        let role = config.effective_role();
        let mut session = Session::new("client", role, config.policy, engine);
        let state = session.subscribe();

        if config.media_up_front {
            for track in source.acquire().await? {
                session.handle(Trigger::AddTrack(track)).await?;
            }
        }

        let (channel, code) = match &config.shape {
            ChannelShape::RequestResponse { base_url } => {
                let rendezvous = RendezvousClient::new(base_url)?;
                let (offer, trailing) = start_offer(&mut session).await?;
                let pairing = rendezvous.request_pairing(&offer).await?;
                let url = rendezvous.client_channel_url(&pairing.code)?;
                let channel = ws::connect(&url, None, config.connect_timeout).await?;

                // Anything queued behind the offer goes out first on the
                // code-scoped channel.
                for message in &trailing {
                    channel.send(message).map_err(|e| session.fail(e))?;
                }
                let answer = SignalingMessage::Answer { sdp: pairing.sdp };
                session.handle(Trigger::Remote(answer)).await?;
                flush(&mut session, &channel.sender())?;
                (channel, Some(pairing.code))
            }
            ChannelShape::Persistent { endpoint } => {
                let channel =
                    ws::connect(endpoint, config.initial_payload.clone(), config.connect_timeout)
                        .await?;
                match role {
                    Role::Offerer => session.handle(Trigger::Start).await?,
                    Role::Answerer => session.await_offer().map_err(|e| session.fail(e))?,
                }
                flush(&mut session, &channel.sender())?;
                (channel, None)
            }
        };

        let media = if config.media_up_front {
            None
        } else {
            Some(source)
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            session,
            channel,
            local_candidates,
            command_rx,
            media,
        ));

        Ok(Self {
            code,
            state,
            commands,
            task,
        })
    }

    /// Pairing code, for request/response channels.
    pub fn code(&self) -> Option<&RendezvousCode> {
        self.code.as_ref()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Wait until the session is `Connected` and hand it back.
    ///
    /// If the session ends first, the error is whatever ended it: the
    /// protocol violation, engine failure or channel error the task
    /// returned. A session closed without error before connecting is
    /// [`ChannelUnavailable`](SignalError::ChannelUnavailable).
    pub async fn connected(self) -> Result<Self> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == NegotiationState::Connected || s.is_terminal())
            .await
            .map(|s| *s);
        if let Ok(NegotiationState::Connected) = reached {
            return Ok(self);
        }
        let state = self.state();
        self.join().await?;
        Err(SignalError::ChannelUnavailable(format!(
            "session ended {state:?} before connecting"
        )))
    }

    /// Attach a track mid-session; the client renegotiates if it offered.
    pub fn add_track(&self, track: MediaTrack) -> Result<()> {
        self.command(Command::Trigger(Trigger::AddTrack(track)))
    }

    pub fn close(&self) {
        let _ = self.command(Command::Close);
    }

    /// Wait for the session task and return its outcome.
    pub async fn join(self) -> Result<()> {
        super::join_task(self.task).await
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SignalError::ChannelUnavailable("session already finished".to_string()))
    }
}

/// Start the first round and split the offer from whatever was queued
/// behind it.
async fn start_offer<E: MediaEngine>(
    session: &mut Session<E>,
) -> Result<(String, Vec<SignalingMessage>)> {
    session.handle(Trigger::Start).await?;
    let mut offer = None;
    let mut trailing = Vec::new();
    for message in session.poll_output() {
        match message {
            SignalingMessage::Offer { sdp } if offer.is_none() => offer = Some(sdp),
            other => trailing.push(other),
        }
    }
    match offer {
        Some(sdp) => Ok((sdp, trailing)),
        None => Err(session.fail(SignalError::Engine("no offer produced".to_string()))),
    }
}

fn flush<E: MediaEngine>(session: &mut Session<E>, sender: &ChannelSender) -> Result<()> {
    let sent: Result<()> = session
        .poll_output()
        .try_for_each(|message| sender.send(&message));
    sent.map_err(|e| session.fail(e))
}

async fn drive<E, S>(
    mut session: Session<E>,
    mut channel: SignalingChannel,
    mut local_candidates: CandidateStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut media: Option<S>,
) -> Result<()>
where
    E: MediaEngine,
    S: MediaSource,
{
    let sender = channel.sender();
    let outcome: Result<()> = async {
        settle(&mut session, &sender, &mut media).await?;
        loop {
            let trigger = tokio::select! {
                received = channel.recv::<SignalingMessage>() => match received {
                    Ok(Some(message)) => Trigger::Remote(message),
                    Ok(None) => Trigger::ChannelClosed,
                    Err(e) => return Err(session.fail(e)),
                },
                Some(candidate) = local_candidates.recv() => Trigger::LocalCandidate(candidate),
                command = commands.recv() => match command {
                    Some(Command::Trigger(trigger)) => trigger,
                    Some(Command::Close) | None => {
                        channel.close();
                        Trigger::ChannelClosed
                    }
                },
            };

            session.handle(trigger).await?;
            settle(&mut session, &sender, &mut media).await?;
            if session.state().is_terminal() {
                return Ok(());
            }
        }
    }
    .await;

    channel.close();
    match &outcome {
        Ok(()) => tracing::debug!(state = ?session.state(), "client session finished"),
        Err(e) => tracing::warn!(error = %e, "client session failed"),
    }
    outcome
}

/// Follow-up work after a trigger: late media, the answer, then
/// everything queued for the peer.
async fn settle<E, S>(
    session: &mut Session<E>,
    sender: &ChannelSender,
    media: &mut Option<S>,
) -> Result<()>
where
    E: MediaEngine,
    S: MediaSource,
{
    acquire_late_media(session, media).await?;
    if session.state() == NegotiationState::OfferReceived {
        session.answer().await.map_err(|e| session.fail(e))?;
    }
    flush(session, sender)
}

/// Take media once the remote description is committed. An answerer
/// attaches it before answering; an offerer attaches it after connecting,
/// which starts a renegotiation round.
async fn acquire_late_media<E, S>(session: &mut Session<E>, media: &mut Option<S>) -> Result<()>
where
    E: MediaEngine,
    S: MediaSource,
{
    let ready = match session.state() {
        NegotiationState::OfferReceived => true,
        NegotiationState::Connected => session.role() == Role::Offerer,
        _ => false,
    };
    if !ready {
        return Ok(());
    }
    let Some(mut source) = media.take() else {
        return Ok(());
    };
    let tracks = source.acquire().await.map_err(|e| session.fail(e))?;
    tracing::info!(count = tracks.len(), "media acquired");
    for track in tracks {
        session.handle(Trigger::AddTrack(track)).await?;
    }
    Ok(())
}
