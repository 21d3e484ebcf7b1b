use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use url::Url;

use super::{CLIENT_CHANNEL_PATH, CLIENT_PATH, HOST_CHANNEL_PATH, HOST_PATH};
use crate::error::{Result, SignalError, ViolationKind};
use crate::protocol::{Pairing, RendezvousCode, SignalingMessage};

/// HTTP side of the rendezvous contract, as seen by hosts and clients.
#[derive(Clone)]
pub struct RendezvousClient {
    base: Url,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl RendezvousClient {
    /// `base_url` is the service root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            SignalError::ChannelUnavailable(format!("invalid rendezvous url {base_url}: {e}"))
        })?;
        if base.scheme() != "http" {
            return Err(SignalError::ChannelUnavailable(format!(
                "unsupported rendezvous scheme {}",
                base.scheme()
            )));
        }
        let http = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self { base, http })
    }

    /// `POST /api/host`: claim the host slot and receive its code.
    pub async fn register_host(&self) -> Result<RendezvousCode> {
        let (status, body) = self.post(HOST_PATH, String::new()).await?;
        match status {
            StatusCode::CREATED => {
                let code = String::from_utf8_lossy(&body).trim().to_string();
                if code.is_empty() {
                    return Err(SignalError::violation(ViolationKind::MissingField("code")));
                }
                tracing::info!(%code, "registered as host");
                Ok(RendezvousCode::new(code))
            }
            StatusCode::UNAUTHORIZED | StatusCode::CONFLICT => Err(
                SignalError::RendezvousExhausted("a host is already registered".to_string()),
            ),
            other => Err(SignalError::violation(ViolationKind::UnexpectedStatus(
                other.as_u16(),
            ))),
        }
    }

    /// `POST /api/client`: hand the offer to the current host and receive
    /// its answer together with this client's pairing code.
    pub async fn request_pairing(&self, offer_sdp: &str) -> Result<Pairing> {
        let offer = SignalingMessage::Offer {
            sdp: offer_sdp.to_string(),
        };
        let (status, body) = self.post(CLIENT_PATH, offer.encode()).await?;
        match status {
            StatusCode::CREATED => {
                let pairing: Pairing = serde_json::from_slice(&body).map_err(|e| {
                    SignalError::violation(ViolationKind::Malformed(e.to_string()))
                })?;
                tracing::info!(code = %pairing.code, "paired with host");
                Ok(pairing)
            }
            StatusCode::NOT_FOUND => Err(SignalError::RendezvousExhausted(
                "no host available".to_string(),
            )),
            other => Err(SignalError::violation(ViolationKind::UnexpectedStatus(
                other.as_u16(),
            ))),
        }
    }

    pub fn host_channel_url(&self, code: &RendezvousCode) -> Result<String> {
        self.channel_url(HOST_CHANNEL_PATH, code)
    }

    pub fn client_channel_url(&self, code: &RendezvousCode) -> Result<String> {
        self.channel_url(CLIENT_CHANNEL_PATH, code)
    }

    fn channel_url(&self, path: &str, code: &RendezvousCode) -> Result<String> {
        let mut url = self.base.clone();
        url.set_scheme("ws").map_err(|_| {
            SignalError::ChannelUnavailable(format!("cannot derive channel url from {}", self.base))
        })?;
        url.set_path(path);
        url.query_pairs_mut().clear().append_pair("code", code.as_str());
        Ok(url.to_string())
    }

    async fn post(&self, path: &str, body: String) -> Result<(StatusCode, Bytes)> {
        let url = self
            .base
            .join(path)
            .map_err(|e| SignalError::ChannelUnavailable(format!("{path}: {e}")))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| SignalError::ChannelUnavailable(format!("building request: {e}")))?;

        tracing::debug!(%url, "rendezvous request");
        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| SignalError::ChannelUnavailable(format!("{url}: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SignalError::ChannelUnavailable(format!("reading {url}: {e}")))?
            .to_bytes();
        tracing::debug!(%url, %status, len = body.len(), "rendezvous response");
        Ok((status, body))
    }
}
