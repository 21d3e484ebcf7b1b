use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use super::{Frame, SignalingChannel};
use crate::error::{Result, SignalError};

/// Open a WebSocket signaling channel to `url`.
///
/// `initial_payload`, when given, is the first frame sent after the
/// handshake. `timeout` bounds the handshake; `None` waits indefinitely.
/// Failing to connect is [`SignalError::ChannelUnavailable`].
pub async fn connect(
    url: &str,
    initial_payload: Option<String>,
    timeout: Option<Duration>,
) -> Result<SignalingChannel> {
    tracing::debug!(url, "opening signaling channel");

    let connecting = tokio_tungstenite::connect_async(url);
    let connected = match timeout {
        Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
            SignalError::ChannelUnavailable(format!("timed out after {limit:?} connecting to {url}"))
        })?,
        None => connecting.await,
    };
    let (ws, _response) =
        connected.map_err(|e| SignalError::ChannelUnavailable(format!("{url}: {e}")))?;

    tracing::info!(url, "signaling channel open");

    let channel = spawn_pumps(ws, url);
    if let Some(payload) = initial_payload {
        channel.send_text(payload)?;
    }
    Ok(channel)
}

/// Wrap an already-upgraded server-side connection.
pub async fn accept<S>(io: S, peer: &str) -> SignalingChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    spawn_pumps(ws, peer)
}

/// Split the socket into a writer task fed from the outbound queue and a
/// reader task feeding the inbound queue.
fn spawn_pumps<S>(ws: WebSocketStream<S>, peer: &str) -> SignalingChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_peer = peer.to_string();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!(peer = %writer_peer, error = %e, "websocket write failed");
                        break;
                    }
                }
                Frame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
        tracing::trace!(peer = %writer_peer, "writer pump exited");
    });

    let reader_peer = peer.to_string();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(Frame::Text(text)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {
                    tracing::warn!(peer = %reader_peer, "ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = %reader_peer, error = %e, "websocket read failed");
                    break;
                }
            }
        }
        let _ = inbound_tx.send(Frame::Close);
        tracing::trace!(peer = %reader_peer, "reader pump exited");
    });

    SignalingChannel::from_parts(peer, outbound_tx, inbound_rx)
}
