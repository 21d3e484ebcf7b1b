//! Integration tests: hosts and clients negotiating through a real
//! rendezvous server on a loopback port.
//!
//! Media engines are fakes (see `common`), everything else is the real
//! stack: HTTP pairing, WebSocket channels, relay, registry, sessions.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use common::{FakeFactory, FakeSource, eventually};
use signalcast::transport::ws;
use signalcast::{
    ClientConfig, ClientSession, HostConfig, HostHandle, IceCandidate, MediaTrack,
    NegotiationPolicy, NegotiationState, RendezvousClient, RendezvousConfig, RendezvousServer, Role,
    SignalError,
    SignalingMessage, TrackKind,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (RendezvousServer, String) {
    let mut server = RendezvousServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    server.start().await.expect("server start");
    let base = server.base_url().expect("bound address");
    (server, base)
}

fn screen() -> Vec<MediaTrack> {
    vec![MediaTrack::new("screen", TrackKind::Video)]
}

async fn post_status(base: &str, path: &str, body: &str) -> u16 {
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("{base}{path}"))
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    client.request(request).await.unwrap().status().as_u16()
}

async fn next_message(ws: &mut WebSocketStream<TcpStream>) -> signalcast::Result<SignalingMessage> {
    let frame = ws.next().await.unwrap().unwrap();
    SignalingMessage::decode(&frame.into_text().unwrap())
}

async fn connected(client: ClientSession) -> ClientSession {
    tokio::time::timeout(WAIT, client.connected())
        .await
        .expect("timed out waiting for Connected")
        .expect("client session ended before connecting")
}

#[tokio::test]
async fn host_and_client_negotiate_through_rendezvous() {
    let (_server, base) = start_server().await;

    let host_engines = FakeFactory::new("host", 2);
    let mut host = HostHandle::start(
        HostConfig::new(&base),
        host_engines.clone(),
        FakeSource::with(screen()),
    )
    .await
    .unwrap();
    assert_eq!(host.code().as_str().len(), 4);

    let client_engines = FakeFactory::new("client", 3);
    let mut config = ClientConfig::request_response(&base);
    config.policy = NegotiationPolicy::conservative();
    config.media_up_front = true;
    let client = ClientSession::connect(config, &client_engines, FakeSource::with(Vec::new()))
        .await
        .unwrap();
    let client = connected(client).await;
    let code = client.code().cloned().unwrap();

    // The host session for this code applies the client's three
    // candidates, in order, after the client's offer.
    eventually("host to apply client candidates", || {
        host_engines.log(0).is_some_and(|log| log.applied.len() == 3)
    })
    .await;
    let host_log = host_engines.log(0).unwrap();
    assert_eq!(
        host_log.applied,
        vec![
            "candidate:client0-1-0",
            "candidate:client0-1-1",
            "candidate:client0-1-2"
        ]
    );
    assert_eq!(host_log.remote_sdps, vec!["offer from client0 #1"]);
    assert_eq!(host_log.calls[0], "add_track screen");
    let answered = host_log
        .calls
        .iter()
        .position(|c| c == "create_answer")
        .unwrap();
    let remote_set = host_log
        .calls
        .iter()
        .position(|c| c.starts_with("set_remote"))
        .unwrap();
    assert!(remote_set < answered);

    eventually("client to apply host candidates", || {
        client_engines.log(0).is_some_and(|log| log.applied.len() == 2)
    })
    .await;
    let client_log = client_engines.log(0).unwrap();
    assert_eq!(client_log.remote_sdps, vec!["answer from host0 #1"]);
    assert_eq!(
        client_log.applied,
        vec!["candidate:host0-1-0", "candidate:host0-1-1"]
    );

    assert_eq!(host.registry().codes(), vec![code.clone()]);
    assert_eq!(
        host.registry().state(&code),
        Some(NegotiationState::Connected)
    );

    client.close();
    client.join().await.unwrap();
    host.close();
    host.join().await.unwrap();
}

#[tokio::test]
async fn late_media_triggers_renegotiation() {
    let (_server, base) = start_server().await;
    let host_engines = FakeFactory::new("host", 1);
    let _host = HostHandle::start(
        HostConfig::new(&base),
        host_engines.clone(),
        FakeSource::with(screen()),
    )
    .await
    .unwrap();

    let client_engines = FakeFactory::new("client", 1);
    let config = ClientConfig::request_response(&base);
    let mic = MediaTrack::new("mic", TrackKind::Audio);
    let client = ClientSession::connect(config, &client_engines, FakeSource::with(vec![mic]))
        .await
        .unwrap();

    eventually("second round to complete", || {
        client_engines
            .log(0)
            .is_some_and(|log| log.remote_sdps.len() == 2)
    })
    .await;
    let client = connected(client).await;

    let client_log = client_engines.log(0).unwrap();
    assert_eq!(client_log.tracks, vec!["mic"]);
    // No media before the first answer was installed.
    let first_remote = client_log
        .calls
        .iter()
        .position(|c| c.starts_with("set_remote"))
        .unwrap();
    let track = client_log
        .calls
        .iter()
        .position(|c| c == "add_track mic")
        .unwrap();
    assert!(first_remote < track);

    let host_log = host_engines.log(0).unwrap();
    assert_eq!(
        host_log.remote_sdps,
        vec!["offer from client0 #1", "offer from client0 #2"]
    );
    assert_eq!(host_engines.logs().len(), 1, "renegotiation reuses the session");
}

#[tokio::test]
async fn concurrent_clients_stay_isolated() {
    let (_server, base) = start_server().await;
    let host_engines = FakeFactory::new("host", 1);
    let host = HostHandle::start(
        HostConfig::new(&base),
        host_engines.clone(),
        FakeSource::with(screen()),
    )
    .await
    .unwrap();

    let alice_engines = FakeFactory::new("alice", 3);
    let bob_engines = FakeFactory::new("bob", 3);
    let (alice, bob) = tokio::join!(
        ClientSession::connect(
            ClientConfig::request_response(&base),
            &alice_engines,
            FakeSource::with(Vec::new()),
        ),
        ClientSession::connect(
            ClientConfig::request_response(&base),
            &bob_engines,
            FakeSource::with(Vec::new()),
        ),
    );
    let (alice, bob) = (alice.unwrap(), bob.unwrap());
    let alice = connected(alice).await;
    let bob = connected(bob).await;
    assert_ne!(alice.code(), bob.code());

    eventually("both host sessions to apply candidates", || {
        let logs = host_engines.logs();
        logs.len() == 2 && logs.iter().all(|log| log.applied.len() == 3)
    })
    .await;

    for log in host_engines.logs() {
        let peer = if log.remote_sdps[0].contains("alice") {
            "alice0"
        } else {
            "bob0"
        };
        assert_eq!(log.remote_sdps, vec![format!("offer from {peer} #1")]);
        for candidate in &log.applied {
            assert!(
                candidate.starts_with(&format!("candidate:{peer}-")),
                "{} received {candidate}",
                log.name
            );
        }
    }
    assert_eq!(host.session_count(), 2);

    for engines in [&alice_engines, &bob_engines] {
        eventually("client to apply its host candidate", || {
            engines.log(0).is_some_and(|log| log.applied.len() == 1)
        })
        .await;
    }
}

#[tokio::test]
async fn rendezvous_rejects_second_host_and_hostless_client() {
    let (server, base) = start_server().await;
    let offer = SignalingMessage::Offer {
        sdp: "v=0".to_string(),
    }
    .encode();

    assert_eq!(post_status(&base, "/api/client", &offer).await, 404);
    assert_eq!(post_status(&base, "/api/host", "").await, 201);
    assert_eq!(post_status(&base, "/api/host", "").await, 401);
    assert!(server.has_host());

    let rendezvous = RendezvousClient::new(&base).unwrap();
    assert!(matches!(
        rendezvous.register_host().await,
        Err(SignalError::RendezvousExhausted(_))
    ));
    // Registered but never opened its channel: still no host to pair with.
    assert!(matches!(
        rendezvous.request_pairing("v=0").await,
        Err(SignalError::RendezvousExhausted(_))
    ));

    assert_eq!(post_status(&base, "/api/client", "not an offer").await, 400);
    assert_eq!(post_status(&base, "/nowhere", "").await, 404);
}

#[tokio::test]
async fn client_without_host_fails_with_rendezvous_exhausted() {
    let (_server, base) = start_server().await;
    let engines = FakeFactory::new("client", 1);
    let result = ClientSession::connect(
        ClientConfig::request_response(&base),
        &engines,
        FakeSource::with(Vec::new()),
    )
    .await;
    assert!(matches!(result, Err(SignalError::RendezvousExhausted(_))));
}

#[tokio::test]
async fn channels_require_a_valid_code() {
    let (_server, base) = start_server().await;
    let rendezvous = RendezvousClient::new(&base).unwrap();
    let code = rendezvous.register_host().await.unwrap();

    let wrong = base.replace("http://", "ws://") + "/ws/host?code=NOPE";
    assert!(matches!(
        ws::connect(&wrong, None, Some(WAIT)).await,
        Err(SignalError::ChannelUnavailable(_))
    ));
    let unknown_client = base.replace("http://", "ws://") + "/ws/client?code=NOPE";
    assert!(matches!(
        ws::connect(&unknown_client, None, Some(WAIT)).await,
        Err(SignalError::ChannelUnavailable(_))
    ));

    let url = rendezvous.host_channel_url(&code).unwrap();
    let channel = ws::connect(&url, None, Some(WAIT)).await.unwrap();
    // The slot is taken once.
    assert!(ws::connect(&url, None, Some(WAIT)).await.is_err());
    channel.close();
}

#[tokio::test]
async fn denied_media_is_reported() {
    let (server, base) = start_server().await;

    let host = HostHandle::start(
        HostConfig::new(&base),
        FakeFactory::new("host", 0),
        FakeSource::denied(),
    )
    .await;
    assert!(matches!(host, Err(SignalError::MediaUnavailable(_))));
    assert!(!server.has_host());

    let mut config = ClientConfig::request_response(&base);
    config.media_up_front = true;
    let client = ClientSession::connect(
        config,
        &FakeFactory::new("client", 0),
        FakeSource::denied(),
    )
    .await;
    assert!(matches!(client, Err(SignalError::MediaUnavailable(_))));
}

#[tokio::test]
async fn persistent_channel_offers_to_a_direct_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let hello = next_message(&mut ws).await;
        let offer = next_message(&mut ws).await.unwrap();

        let mut trickled = Vec::new();
        loop {
            match next_message(&mut ws).await.unwrap() {
                SignalingMessage::Candidate(Some(c)) => trickled.push(c.candidate),
                SignalingMessage::Candidate(None) => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        let answer = SignalingMessage::Answer {
            sdp: "answer from peer".to_string(),
        };
        let candidate = SignalingMessage::Candidate(Some(IceCandidate::new("candidate:peer-0")));
        ws.send(Message::Text(answer.encode())).await.unwrap();
        ws.send(Message::Text(candidate.encode())).await.unwrap();

        let _ = done_rx.await;
        (hello.is_err(), offer, trickled)
    });

    let engines = FakeFactory::new("direct", 2);
    let mut config = ClientConfig::persistent(format!("ws://{addr}"), Role::Offerer);
    config.initial_payload = Some(r#"{"join":"room-1"}"#.to_string());
    config.media_up_front = true;
    let client = ClientSession::connect(config, &engines, FakeSource::with(screen()))
        .await
        .unwrap();
    assert!(client.code().is_none());

    let client = connected(client).await;
    eventually("client to apply the peer candidate", || {
        engines
            .log(0)
            .is_some_and(|log| log.applied == vec!["candidate:peer-0"])
    })
    .await;

    done_tx.send(()).unwrap();
    let (hello_rejected, offer, trickled) = peer.await.unwrap();
    // The join payload is not a signaling message.
    assert!(hello_rejected);
    assert_eq!(
        offer,
        SignalingMessage::Offer {
            sdp: "offer from direct0 #1".to_string()
        }
    );
    assert_eq!(
        trickled,
        vec!["candidate:direct0-1-0", "candidate:direct0-1-1"]
    );

    // The peer hung up: the session ends Closed, not Failed.
    client.join().await.unwrap();
}

#[tokio::test]
async fn persistent_answerer_waits_for_offer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        // Trickle ahead of the offer; the client must hold it.
        let early = SignalingMessage::Candidate(Some(IceCandidate::new("candidate:early")));
        let offer = SignalingMessage::Offer {
            sdp: "offer from peer".to_string(),
        };
        ws.send(Message::Text(early.encode())).await.unwrap();
        ws.send(Message::Text(offer.encode())).await.unwrap();

        let answer = next_message(&mut ws).await.unwrap();
        let end = next_message(&mut ws).await.unwrap();
        ws.close(None).await.unwrap();
        (answer, end)
    });

    let engines = FakeFactory::new("viewer", 0);
    let config = ClientConfig::persistent(format!("ws://{addr}"), Role::Answerer);
    let mic = MediaTrack::new("mic", TrackKind::Audio);
    let client = ClientSession::connect(config, &engines, FakeSource::with(vec![mic]))
        .await
        .unwrap();

    let (answer, end) = peer.await.unwrap();
    assert_eq!(end, SignalingMessage::Candidate(None));
    assert_eq!(
        answer,
        SignalingMessage::Answer {
            sdp: "answer from viewer0 #1".to_string()
        }
    );
    client.join().await.unwrap();

    let log = engines.log(0).unwrap();
    assert_eq!(log.applied, vec!["candidate:early"]);
    // Media only after the offer was installed, and before answering.
    let calls: Vec<&str> = log.calls.iter().map(String::as_str).collect();
    assert_eq!(
        calls,
        vec![
            "set_remote offer from peer",
            "add_candidate candidate:early",
            "add_track mic",
            "create_answer",
            "set_local answer from viewer0 #1",
        ]
    );
}

#[tokio::test]
async fn abandoned_host_registration_is_released() {
    let mut server = RendezvousServer::with_config(RendezvousConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        claim_timeout: Duration::from_millis(200),
        ..RendezvousConfig::default()
    });
    server.start().await.unwrap();
    let base = server.base_url().unwrap();

    // Registered, then never opened /ws/host.
    let rendezvous = RendezvousClient::new(&base).unwrap();
    rendezvous.register_host().await.unwrap();
    assert!(matches!(
        rendezvous.register_host().await,
        Err(SignalError::RendezvousExhausted(_))
    ));
    eventually("stale registration to expire", || !server.has_host()).await;

    let host = HostHandle::start(
        HostConfig::new(&base),
        FakeFactory::new("host", 0),
        FakeSource::with(screen()),
    )
    .await
    .unwrap();
    assert!(server.has_host());
    drop(host);
}

#[tokio::test]
async fn client_leaving_closes_its_host_session() {
    let (server, base) = start_server().await;
    let mut host = HostHandle::start(
        HostConfig::new(&base),
        FakeFactory::new("host", 1),
        FakeSource::with(screen()),
    )
    .await
    .unwrap();

    let client = ClientSession::connect(
        ClientConfig::request_response(&base),
        &FakeFactory::new("client", 1),
        FakeSource::with(Vec::new()),
    )
    .await
    .unwrap();
    let client = connected(client).await;
    eventually("host session to register", || host.session_count() == 1).await;

    client.close();
    client.join().await.unwrap();
    eventually("host session to close", || host.session_count() == 0).await;
    assert_eq!(server.client_count(), 0);
    assert!(server.has_host(), "the host channel stays up");

    host.close();
    host.join().await.unwrap();
}

#[tokio::test]
async fn connected_reports_why_the_session_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        // An answer to an answerer that never offered.
        let answer = SignalingMessage::Answer {
            sdp: "answer nobody asked for".to_string(),
        };
        ws.send(Message::Text(answer.encode())).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = ClientConfig::persistent(format!("ws://{addr}"), Role::Answerer);
    let client = ClientSession::connect(
        config,
        &FakeFactory::new("viewer", 0),
        FakeSource::with(Vec::new()),
    )
    .await
    .unwrap();

    let err = tokio::time::timeout(WAIT, client.connected())
        .await
        .expect("timed out waiting for the session to end")
        .err()
        .expect("session must not connect");
    assert!(err.is_protocol_violation(), "got {err}");
    peer.await.unwrap();
}
