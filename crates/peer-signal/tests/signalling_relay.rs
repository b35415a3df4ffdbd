use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use peer_signal::{
    ClientEvent, ConnectionType, DataConnection, ExchangeChannel, IceCandidate, IncomingRequest,
    ManagerOptions, PeerId, PeerManager, RelayConfig, SessionDescription, SignalError,
    SignallingClient, SignallingEvent, SignallingOptions,
};

const WAIT: Duration = Duration::from_secs(5);
/// ICE and DTLS on loopback, with room for slow CI hosts.
const NEGOTIATION_WAIT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
struct RelayState {
    peers: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
    frames: Arc<AsyncMutex<Vec<Value>>>,
    issued: Arc<AtomicU32>,
    /// Accept sockets but never answer them.
    silent: Arc<AtomicBool>,
}

impl RelayState {
    async fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|frame| frame.get("type").and_then(Value::as_str) == Some(kind))
            .cloned()
            .collect()
    }
}

struct FakeRelay {
    addr: SocketAddr,
    state: RelayState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeRelay {
    async fn start() -> Self {
        init_tracing();
        let state = RelayState::default();
        let router = Router::new()
            .route("/peerjs", get(socket))
            .route("/api/id", get(issue_id))
            .route("/api/peers", get(list_peers))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    fn config(&self) -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            path: "/".into(),
            key: "peerjs".into(),
            secure: false,
        }
    }

    fn client(&self) -> Arc<SignallingClient> {
        self.client_with(SignallingOptions::default())
    }

    fn client_with(&self, options: SignallingOptions) -> Arc<SignallingClient> {
        Arc::new(SignallingClient::new(self.config(), options))
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn issue_id(State(state): State<RelayState>) -> String {
    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    format!("issued-{n}")
}

async fn list_peers(State(state): State<RelayState>) -> Json<Vec<String>> {
    let mut peers: Vec<String> = state.peers.lock().await.keys().cloned().collect();
    peers.sort();
    Json(peers)
}

async fn socket(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let id = params.get("id").cloned().unwrap_or_default();
    let key_ok = params.get("key").map(String::as_str) == Some("peerjs");
    ws.on_upgrade(move |socket| serve_peer(socket, state, id, key_ok))
}

async fn serve_peer(socket: WebSocket, state: RelayState, id: String, key_ok: bool) {
    let (mut sink, mut stream) = socket.split();
    if state.silent.load(Ordering::SeqCst) {
        while let Some(Ok(_)) = stream.next().await {}
        return;
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let refusal = {
        let mut peers = state.peers.lock().await;
        if !key_ok {
            Some(json!({"type": "INVALID-KEY", "payload": {"msg": "Invalid key provided"}}))
        } else if peers.contains_key(&id) {
            Some(json!({"type": "ID-TAKEN", "payload": {"msg": "ID is taken"}}))
        } else {
            peers.insert(id.clone(), tx.clone());
            None
        }
    };
    if let Some(refusal) = refusal {
        let _ = tx.send(refusal.to_string());
        drop(tx);
        let _ = writer.await;
        return;
    }
    let _ = tx.send(json!({"type": "OPEN"}).to_string());

    while let Some(Ok(message)) = stream.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(mut frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.frames.lock().await.push(frame.clone());
        let Some(dst) = frame.get("dst").and_then(Value::as_str).map(str::to_owned) else {
            continue;
        };
        frame["src"] = json!(id);
        let target = state.peers.lock().await.get(&dst).cloned();
        match target {
            Some(peer) => {
                let _ = peer.send(frame.to_string());
            }
            None => {
                let _ = tx.send(json!({"type": "EXPIRE", "src": dst}).to_string());
            }
        }
    }

    state.peers.lock().await.remove(&id);
    writer.abort();
}

fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\n")
}

fn answer() -> SessionDescription {
    SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=-\r\n")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignallingEvent>) -> SignallingEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event stream open")
}

async fn wait_for_frames(state: &RelayState, kind: &str, count: usize) {
    timeout(WAIT, async {
        while state.frames_of(kind).await.len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay saw the frames");
}

#[tokio::test]
async fn requested_id_opens_a_session() {
    let relay = FakeRelay::start().await;
    let client = relay.client();
    let mut events = client.take_events().expect("events");

    let peer_id = client
        .connect(Some(PeerId::new("operator")))
        .await
        .expect("connect");

    assert_eq!(peer_id, PeerId::new("operator"));
    assert!(client.is_connected());
    assert_eq!(client.peer_id(), Some(PeerId::new("operator")));
    assert_eq!(
        next_event(&mut events).await,
        SignallingEvent::Opened {
            peer_id: PeerId::new("operator")
        }
    );
    assert!(matches!(
        client.connect(None).await,
        Err(SignalError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn relay_issues_an_id_when_none_is_given() {
    let relay = FakeRelay::start().await;
    let client = relay.client();

    let peer_id = client.connect(None).await.expect("connect");

    assert_eq!(peer_id, PeerId::new("issued-1"));
    assert!(client.is_connected());
}

#[tokio::test]
async fn taken_id_is_refused() {
    let relay = FakeRelay::start().await;
    let first = relay.client();
    first
        .connect(Some(PeerId::new("operator")))
        .await
        .expect("first connect");

    let second = relay.client();
    let mut events = second.take_events().expect("events");
    let result = second.connect(Some(PeerId::new("operator"))).await;

    assert!(matches!(result, Err(SignalError::Refused(ref reason)) if reason == "ID is taken"));
    assert!(!second.is_connected());
    assert_eq!(
        next_event(&mut events).await,
        SignallingEvent::Error {
            reason: "ID is taken".into()
        }
    );
}

#[tokio::test]
async fn data_offer_is_answered_and_registered_on_both_sides() {
    let relay = FakeRelay::start().await;
    let alice = relay.client();
    let bob = relay.client();
    let mut bob_events = bob.take_events().expect("events");
    alice.connect(Some(PeerId::new("alice"))).await.expect("alice");
    bob.connect(Some(PeerId::new("bob"))).await.expect("bob");
    assert!(matches!(next_event(&mut bob_events).await, SignallingEvent::Opened { .. }));

    let answering = {
        let bob = Arc::clone(&bob);
        tokio::spawn(async move {
            let SignallingEvent::OfferReceived(incoming) = next_event(&mut bob_events).await else {
                panic!("expected an offer");
            };
            assert_eq!(incoming.peer_id, PeerId::new("alice"));
            assert_eq!(incoming.kind, ConnectionType::Data);
            assert_eq!(incoming.description, offer());
            bob.answer(&incoming.connection_id, answer()).expect("answer");
            (incoming.connection_id, bob_events)
        })
    };

    let mut seen_id = None;
    let received = alice
        .exchange_data(&PeerId::new("bob"), offer(), |id| {
            seen_id = Some(id.clone());
        })
        .await
        .expect("answer arrives");
    let (bob_side_id, mut bob_events) = answering.await.expect("bob task");

    assert_eq!(received, answer());
    let connection_id = seen_id.expect("id reported before the offer left");
    assert_eq!(connection_id, bob_side_id);
    assert!(connection_id.as_str().starts_with("dc_"));
    assert_eq!(alice.registered_connections(), 1);
    assert_eq!(bob.registered_connections(), 1);
    let info = alice.connection_info(&connection_id).expect("registered");
    assert_eq!(info.peer_id, PeerId::new("bob"));

    let offers = relay.state.frames_of("OFFER").await;
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["payload"]["serialization"], json!("json"));
    assert_eq!(offers[0]["payload"]["connectionId"], json!(connection_id.as_str()));

    let candidate = IceCandidate {
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
        candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
    };
    alice
        .send_candidate(&connection_id, candidate.clone())
        .expect("candidate sent");
    assert_eq!(
        next_event(&mut bob_events).await,
        SignallingEvent::CandidateReceived {
            peer_id: PeerId::new("alice"),
            connection_id: connection_id.clone(),
            candidate,
        }
    );

    alice.forget_connection(&PeerId::new("bob"), &connection_id);
    assert_eq!(alice.registered_connections(), 0);
}

#[tokio::test]
async fn second_offer_to_a_waiting_peer_is_refused_locally() {
    let relay = FakeRelay::start().await;
    let alice = relay.client_with(SignallingOptions {
        offer_timeout: Duration::from_millis(400),
        ..SignallingOptions::default()
    });
    let bob = relay.client();
    alice.connect(Some(PeerId::new("alice"))).await.expect("alice");
    bob.connect(Some(PeerId::new("bob"))).await.expect("bob");

    let first = {
        let alice = Arc::clone(&alice);
        tokio::spawn(async move {
            alice
                .exchange_data(&PeerId::new("bob"), offer(), |_| {})
                .await
        })
    };
    wait_for_frames(&relay.state, "OFFER", 1).await;

    let mut called = false;
    let second = alice
        .call(&PeerId::new("bob"), offer(), |_| called = true)
        .await;
    assert!(matches!(second, Err(SignalError::OfferPending(ref peer)) if peer.as_str() == "bob"));
    assert!(!called);

    let first = first.await.expect("first offer task");
    assert!(matches!(first, Err(SignalError::Timeout { .. })));
    assert_eq!(relay.state.frames_of("OFFER").await.len(), 1);
    assert_eq!(alice.registered_connections(), 0);

    // The slot is free again once the first offer resolved.
    let third = {
        let alice = Arc::clone(&alice);
        tokio::spawn(async move { alice.call(&PeerId::new("bob"), offer(), |_| {}).await })
    };
    wait_for_frames(&relay.state, "OFFER", 2).await;
    third.abort();
}

#[tokio::test]
async fn offer_to_an_unknown_peer_expires() {
    let relay = FakeRelay::start().await;
    let alice = relay.client();
    alice.connect(Some(PeerId::new("alice"))).await.expect("alice");

    let result = alice
        .exchange_data(&PeerId::new("ghost"), offer(), |_| {})
        .await;

    assert!(matches!(result, Err(SignalError::Rejected(_))));
    assert_eq!(alice.registered_connections(), 0);
}

#[tokio::test]
async fn active_peers_excludes_self() {
    let relay = FakeRelay::start().await;
    let alice = relay.client();
    let bob = relay.client();
    alice.connect(Some(PeerId::new("alice"))).await.expect("alice");
    bob.connect(Some(PeerId::new("bob"))).await.expect("bob");

    let peers = alice.active_peers().await.expect("peers");

    assert_eq!(peers, vec![PeerId::new("bob")]);
}

#[tokio::test]
async fn disconnect_closes_the_session_once() {
    let relay = FakeRelay::start().await;
    let client = relay.client();
    let mut events = client.take_events().expect("events");
    client
        .connect(Some(PeerId::new("operator")))
        .await
        .expect("connect");
    assert!(matches!(next_event(&mut events).await, SignallingEvent::Opened { .. }));

    client.disconnect().expect("disconnect");
    assert!(!client.is_connected());
    assert_eq!(next_event(&mut events).await, SignallingEvent::Closed);
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

    assert!(matches!(client.disconnect(), Err(SignalError::NotConnected)));
    timeout(WAIT, async {
        while relay.state.peers.lock().await.contains_key("operator") {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay released the id");
    let peer_id = client
        .connect(Some(PeerId::new("operator")))
        .await
        .expect("reconnect under the same id");
    assert_eq!(peer_id, PeerId::new("operator"));
}

#[tokio::test]
async fn offers_fail_without_a_session() {
    let relay = FakeRelay::start().await;
    let client = relay.client();

    let result = client
        .exchange_data(&PeerId::new("bob"), offer(), |_| {})
        .await;

    assert!(matches!(result, Err(SignalError::NotConnected)));
}

#[tokio::test]
async fn silent_relay_fails_the_handshake_in_time() {
    let relay = FakeRelay::start().await;
    relay.state.silent.store(true, Ordering::SeqCst);
    let client = relay.client_with(SignallingOptions {
        connect_timeout: Duration::from_millis(300),
        ..SignallingOptions::default()
    });

    let result = timeout(WAIT, client.connect(Some(PeerId::new("operator"))))
        .await
        .expect("connect gave up on its own");

    assert!(matches!(result, Err(SignalError::ConnectTimeout(limit)) if limit == Duration::from_millis(300)));
    assert!(!client.is_connected());

    relay.state.silent.store(false, Ordering::SeqCst);
    let peer_id = client
        .connect(Some(PeerId::new("operator")))
        .await
        .expect("connect once the relay answers");
    assert_eq!(peer_id, PeerId::new("operator"));
}

#[tokio::test]
async fn candidate_racing_its_offer_goes_out_second() {
    let relay = FakeRelay::start().await;
    let alice = relay.client();
    let bob = relay.client();
    let mut bob_events = bob.take_events().expect("events");
    alice.connect(Some(PeerId::new("alice"))).await.expect("alice");
    bob.connect(Some(PeerId::new("bob"))).await.expect("bob");
    assert!(matches!(next_event(&mut bob_events).await, SignallingEvent::Opened { .. }));

    let candidate = IceCandidate {
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
        candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".into(),
    };
    let offering = {
        let alice = Arc::clone(&alice);
        let candidate = candidate.clone();
        tokio::spawn(async move {
            let mut racer = None;
            let result = alice
                .exchange_data(&PeerId::new("bob"), offer(), |id| {
                    let alice = Arc::clone(&alice);
                    let id = id.clone();
                    racer = Some(std::thread::spawn(move || alice.send_candidate(&id, candidate)));
                })
                .await;
            (result, racer)
        })
    };

    let SignallingEvent::OfferReceived(incoming) = next_event(&mut bob_events).await else {
        panic!("offer must arrive before its candidate");
    };
    assert_eq!(
        next_event(&mut bob_events).await,
        SignallingEvent::CandidateReceived {
            peer_id: PeerId::new("alice"),
            connection_id: incoming.connection_id.clone(),
            candidate,
        }
    );
    bob.answer(&incoming.connection_id, answer()).expect("answer");

    let (result, racer) = offering.await.expect("offer task");
    assert!(result.is_ok());
    let racer = racer.expect("candidate thread started");
    assert!(racer.join().expect("candidate thread").is_ok());
    let kinds: Vec<Value> = relay
        .state
        .frames
        .lock()
        .await
        .iter()
        .filter(|frame| frame["dst"] == json!("bob"))
        .map(|frame| frame["type"].clone())
        .collect();
    assert_eq!(kinds, vec![json!("OFFER"), json!("CANDIDATE")]);
}

const GREETING: &str = r#"{"type":"0"}"#;
const ACK: &str = r#"{"type":"ack"}"#;

fn loopback_options() -> ManagerOptions {
    ManagerOptions {
        ice_servers: Vec::new(),
        include_loopback: true,
        ..ManagerOptions::default()
    }
}

async fn start_manager(
    relay: &FakeRelay,
    name: &str,
    signalling: SignallingOptions,
    options: ManagerOptions,
) -> (PeerManager, mpsc::UnboundedReceiver<ClientEvent>) {
    let manager = PeerManager::start(relay.client_with(signalling), options)
        .await
        .expect("manager starts");
    let events = manager.events().expect("events");
    manager
        .connect(Some(PeerId::new(name)))
        .await
        .expect("connect");
    (manager, events)
}

/// Skips events until `pick` accepts one.
async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    timeout(NEGOTIATION_WAIT, async {
        loop {
            let event = events.recv().await.expect("client events open");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("client event in time")
}

fn data_request(event: ClientEvent) -> Option<IncomingRequest<DataConnection>> {
    match event {
        ClientEvent::DataRequest(request) => Some(request),
        _ => None,
    }
}

fn closed_data(event: ClientEvent) -> Option<PeerId> {
    match event {
        ClientEvent::ConnectionClosed {
            peer_id,
            kind: ConnectionType::Data,
            ..
        } => Some(peer_id),
        _ => None,
    }
}

async fn next_channel(connection: &mut DataConnection) -> ExchangeChannel {
    timeout(NEGOTIATION_WAIT, connection.next_exchange())
        .await
        .expect("channel opens in time")
        .expect("channel announced")
}

async fn next_text(channel: &mut ExchangeChannel) -> String {
    timeout(NEGOTIATION_WAIT, channel.recv())
        .await
        .expect("text in time")
        .expect("channel open")
}

struct Link {
    connection: DataConnection,
    channel: ExchangeChannel,
}

/// Alice offers a "steps" channel to bob, who accepts once alice's
/// candidates are on the wire. Alice greets as soon as her side opens.
async fn open_link(
    relay: &FakeRelay,
    alice: &PeerManager,
    bob_events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> (Link, Link) {
    let bob_id = PeerId::new("bob");
    let offering = async {
        let mut connection = alice
            .exchange_data(&bob_id, Some("steps".into()))
            .await
            .expect("offer answered");
        let channel = next_channel(&mut connection).await;
        assert!(channel.send(GREETING));
        Link {
            connection,
            channel,
        }
    };
    let answering = async {
        let request = wait_for(bob_events, data_request).await;
        assert_eq!(request.peer_id(), &PeerId::new("alice"));
        assert!(request.connection_id().as_str().starts_with("dc_"));
        wait_for_frames(&relay.state, "CANDIDATE", 1).await;
        let mut connection = request.accept();
        let mut channel = next_channel(&mut connection).await;
        assert_eq!(channel.label(), "steps");
        assert_eq!(next_text(&mut channel).await, GREETING);
        Link {
            connection,
            channel,
        }
    };
    tokio::join!(offering, answering)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn data_connection_carries_text_between_managers() {
    let relay = FakeRelay::start().await;
    let (alice, mut alice_events) =
        start_manager(&relay, "alice", SignallingOptions::default(), loopback_options()).await;
    let (bob, mut bob_events) =
        start_manager(&relay, "bob", SignallingOptions::default(), loopback_options()).await;

    let (mut alice_link, bob_link) = open_link(&relay, &alice, &mut bob_events).await;
    assert!(bob_link.channel.send(ACK));
    assert_eq!(next_text(&mut alice_link.channel).await, ACK);

    assert_eq!(alice.signalling().registered_connections(), 1);
    assert_eq!(bob.signalling().registered_connections(), 1);
    assert_eq!(alice.active_connections(Some(ConnectionType::Data)), 1);
    assert_eq!(bob.active_connections(None), 1);
    assert_eq!(
        alice_link.connection.connection_id(),
        bob_link.connection.connection_id()
    );

    alice_link.connection.close();
    assert_eq!(wait_for(&mut alice_events, closed_data).await, PeerId::new("bob"));
    assert_eq!(alice.signalling().registered_connections(), 0);
    assert_eq!(alice.active_connections(None), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_offer_leaves_nothing_registered() {
    let relay = FakeRelay::start().await;
    let impatient = SignallingOptions {
        offer_timeout: Duration::from_millis(500),
        ..SignallingOptions::default()
    };
    let (alice, mut alice_events) = start_manager(&relay, "alice", impatient, loopback_options()).await;
    let (bob, mut bob_events) =
        start_manager(&relay, "bob", SignallingOptions::default(), loopback_options()).await;

    let bob_id = PeerId::new("bob");
    let (offered, ()) = tokio::join!(alice.exchange_data(&bob_id, None), async {
        wait_for(&mut bob_events, data_request).await.reject();
    });

    assert!(matches!(offered, Err(SignalError::Timeout { .. })));
    assert_eq!(wait_for(&mut bob_events, closed_data).await, PeerId::new("alice"));
    assert_eq!(wait_for(&mut alice_events, closed_data).await, PeerId::new("bob"));
    assert_eq!(alice.signalling().registered_connections(), 0);
    assert_eq!(bob.signalling().registered_connections(), 0);
    assert_eq!(alice.active_connections(None), 0);
    assert_eq!(bob.active_connections(None), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecided_offer_is_withdrawn() {
    let relay = FakeRelay::start().await;
    let impatient = SignallingOptions {
        offer_timeout: Duration::from_millis(1_000),
        ..SignallingOptions::default()
    };
    let (alice, _alice_events) = start_manager(&relay, "alice", impatient, loopback_options()).await;
    let (bob, mut bob_events) = start_manager(
        &relay,
        "bob",
        SignallingOptions::default(),
        ManagerOptions {
            decision_timeout: Duration::from_millis(200),
            ..loopback_options()
        },
    )
    .await;

    let bob_id = PeerId::new("bob");
    let (offered, request) = tokio::join!(
        alice.exchange_data(&bob_id, None),
        wait_for(&mut bob_events, data_request)
    );

    assert!(matches!(offered, Err(SignalError::Timeout { .. })));
    assert_eq!(wait_for(&mut bob_events, closed_data).await, PeerId::new("alice"));
    assert_eq!(bob.signalling().registered_connections(), 0);
    assert_eq!(bob.active_connections(None), 0);

    // Too late: the connection behind the request is already gone.
    let mut connection = request.accept();
    let announced = timeout(WAIT, connection.next_exchange())
        .await
        .expect("announcement stream ended");
    assert!(announced.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vanished_peer_closes_the_connection() {
    let relay = FakeRelay::start().await;
    let (alice, _alice_events) =
        start_manager(&relay, "alice", SignallingOptions::default(), loopback_options()).await;
    let (bob, mut bob_events) =
        start_manager(&relay, "bob", SignallingOptions::default(), loopback_options()).await;
    let (_alice_link, _bob_link) = open_link(&relay, &alice, &mut bob_events).await;

    // Alice's relay session stays up, so only ICE can tell bob she is gone.
    alice.shutdown().await;
    assert!(alice.is_connected());

    assert_eq!(wait_for(&mut bob_events, closed_data).await, PeerId::new("alice"));
    assert_eq!(bob.signalling().registered_connections(), 0);
    assert_eq!(bob.active_connections(None), 0);
}
