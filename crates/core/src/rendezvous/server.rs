use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use super::matchmaker::Matchmaker;
use super::{CLIENT_CHANNEL_PATH, CLIENT_PATH, HOST_CHANNEL_PATH, HOST_PATH};
use crate::config::RendezvousConfig;
use crate::error::{Result, SignalError};
use crate::protocol::{CodedMessage, Pairing, RendezvousCode, SignalingMessage};
use crate::transport::{SignalingChannel, ws};

type HttpResponse = Response<Full<Bytes>>;

/// Reference rendezvous service.
///
/// Serves the HTTP pairing endpoints and the two WebSocket channels on one
/// listener, and relays signaling between them. It never looks inside
/// descriptions or candidates.
pub struct RendezvousServer {
    config: RendezvousConfig,
    matchmaker: Arc<Matchmaker>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl RendezvousServer {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_config(RendezvousConfig {
            bind_addr,
            ..RendezvousConfig::default()
        })
    }

    pub fn with_config(config: RendezvousConfig) -> Self {
        Self {
            matchmaker: Arc::new(Matchmaker::new(config.code_len)),
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Bind and start accepting. Returns the bound address, which differs
    /// from the configured one when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(SignalError::AlreadyRunning);
        }
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let matchmaker = self.matchmaker.clone();
        let claim_timeout = self.config.claim_timeout;

        tracing::info!(%addr, code_len = self.config.code_len, "rendezvous server listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let matchmaker = matchmaker.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, matchmaker.clone(), claim_timeout)
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .with_upgrades()
                                    .await
                                {
                                    tracing::debug!(%peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            running.store(false, Ordering::SeqCst);
            tracing::info!(%addr, "rendezvous server stopped");
        });

        Ok(addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `http://<addr>` for the bound listener, if started.
    pub fn base_url(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("http://{addr}"))
    }

    pub fn has_host(&self) -> bool {
        self.matchmaker.has_host()
    }

    /// Clients paired and not yet released.
    pub fn client_count(&self) -> usize {
        self.matchmaker.client_count()
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Incoming>,
    matchmaker: Arc<Matchmaker>,
    claim_timeout: Duration,
) -> std::result::Result<HttpResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::trace!(%method, %path, "request");

    let response = match path.as_str() {
        HOST_PATH if method == Method::POST => register_host(matchmaker, claim_timeout),
        CLIENT_PATH if method == Method::POST => {
            let body = req.collect().await?.to_bytes();
            request_pairing(matchmaker, &body, claim_timeout).await
        }
        HOST_CHANNEL_PATH if method == Method::GET => open_host_channel(req, matchmaker),
        CLIENT_CHANNEL_PATH if method == Method::GET => open_client_channel(req, matchmaker),
        HOST_PATH | CLIENT_PATH | HOST_CHANNEL_PATH | CLIENT_CHANNEL_PATH => {
            status(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        _ => status(StatusCode::NOT_FOUND, "Not Found"),
    };
    tracing::debug!(%method, %path, status = %response.status(), "response");
    Ok(response)
}

fn register_host(matchmaker: Arc<Matchmaker>, claim_timeout: Duration) -> HttpResponse {
    match matchmaker.register_host() {
        Some(code) => {
            let body = code.to_string();
            expire_unclaimed(matchmaker, Slot::Host(code), claim_timeout);
            status(StatusCode::CREATED, body)
        }
        None => status(StatusCode::UNAUTHORIZED, "host already registered"),
    }
}

async fn request_pairing(
    matchmaker: Arc<Matchmaker>,
    body: &[u8],
    claim_timeout: Duration,
) -> HttpResponse {
    let offer = std::str::from_utf8(body)
        .ok()
        .and_then(|text| SignalingMessage::decode(text).ok());
    let Some(SignalingMessage::Offer { sdp }) = offer else {
        return status(StatusCode::BAD_REQUEST, "expected an offer");
    };

    let Some((code, answer_rx)) = matchmaker.request_pairing(sdp) else {
        return status(StatusCode::NOT_FOUND, "no host available");
    };

    let answer = match tokio::time::timeout(claim_timeout, answer_rx).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(_)) => {
            matchmaker.release_client(&code);
            return status(StatusCode::NOT_FOUND, "host left before answering");
        }
        Err(_) => {
            tracing::warn!(%code, "host did not answer in time");
            matchmaker.release_client(&code);
            return status(StatusCode::NOT_FOUND, "host did not answer");
        }
    };

    tracing::info!(%code, clients = matchmaker.client_count(), "pairing matched");
    expire_unclaimed(matchmaker, Slot::Client(code.clone()), claim_timeout);
    match serde_json::to_string(&Pairing { sdp: answer, code }) {
        Ok(json) => {
            let mut response = status(StatusCode::CREATED, json);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn open_host_channel(req: Request<Incoming>, matchmaker: Arc<Matchmaker>) -> HttpResponse {
    let Some(accept) = websocket_accept(req.headers()) else {
        return status(StatusCode::BAD_REQUEST, "invalid websocket handshake");
    };
    let Some(code) = query_code(&req) else {
        return status(StatusCode::BAD_REQUEST, "missing code");
    };
    if !matchmaker.claim_host_channel(&code) {
        return status(StatusCode::NOT_FOUND, "unknown host code");
    }
    let code = RendezvousCode::new(code);

    let abandoned = {
        let (matchmaker, code) = (matchmaker.clone(), code.clone());
        move || matchmaker.release_host(&code)
    };
    upgrade(req, accept, "host", abandoned, move |mut channel| async move {
        matchmaker.attach_host(&code, channel.sender());
        loop {
            match channel.recv::<CodedMessage>().await {
                Ok(Some(message)) => matchmaker.from_host(message),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%code, error = %e, "host channel violated protocol");
                    break;
                }
            }
        }
        matchmaker.release_host(&code);
    })
}

fn open_client_channel(req: Request<Incoming>, matchmaker: Arc<Matchmaker>) -> HttpResponse {
    let Some(accept) = websocket_accept(req.headers()) else {
        return status(StatusCode::BAD_REQUEST, "invalid websocket handshake");
    };
    let Some(code) = query_code(&req) else {
        return status(StatusCode::BAD_REQUEST, "missing code");
    };
    if !matchmaker.claim_client_channel(&code) {
        return status(StatusCode::NOT_FOUND, "unknown or used client code");
    }
    let code = RendezvousCode::new(code);

    let abandoned = {
        let (matchmaker, code) = (matchmaker.clone(), code.clone());
        move || matchmaker.release_client(&code)
    };
    upgrade(req, accept, "client", abandoned, move |mut channel| async move {
        matchmaker.attach_client(&code, channel.sender());
        loop {
            match channel.recv::<SignalingMessage>().await {
                Ok(Some(message)) => {
                    if !matchmaker.from_client(&code, message) {
                        tracing::debug!(%code, "host gone; closing client channel");
                        channel.close();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%code, error = %e, "client channel violated protocol");
                    break;
                }
            }
        }
        matchmaker.release_client(&code);
    })
}

/// Answer `101` and run `serve` on the upgraded connection. If the upgrade
/// never completes, `abandoned` releases the slot that was claimed for it.
fn upgrade<A, F, Fut>(
    req: Request<Incoming>,
    accept: String,
    peer: &'static str,
    abandoned: A,
    serve: F,
) -> HttpResponse
where
    A: FnOnce() + Send + 'static,
    F: FnOnce(SignalingChannel) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        abandoned();
        return status(StatusCode::INTERNAL_SERVER_ERROR, "bad accept key");
    };
    let on_upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let channel = ws::accept(TokioIo::new(upgraded), peer).await;
                serve(channel).await;
            }
            Err(e) => {
                tracing::warn!(peer, error = %e, "websocket upgrade failed");
                abandoned();
            }
        }
    });

    let mut response = status(StatusCode::SWITCHING_PROTOCOLS, Bytes::new());
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// Validate a client handshake and derive `Sec-WebSocket-Accept`.
fn websocket_accept(headers: &HeaderMap) -> Option<String> {
    let has_token = |name: header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    if !has_token(header::CONNECTION, "upgrade")
        || !has_token(header::UPGRADE, "websocket")
        || headers.get(header::SEC_WEBSOCKET_VERSION)?.as_bytes() != b"13"
    {
        return None;
    }
    let key = headers.get(header::SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

enum Slot {
    Host(RendezvousCode),
    Client(RendezvousCode),
}

/// Release `slot` if its channel is still unclaimed after `after`.
fn expire_unclaimed(matchmaker: Arc<Matchmaker>, slot: Slot, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        match slot {
            Slot::Host(code) => matchmaker.expire_host(&code),
            Slot::Client(code) => matchmaker.expire_client(&code),
        }
    });
}

fn query_code(req: &Request<Incoming>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

fn status(code: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = code;
    response
}
