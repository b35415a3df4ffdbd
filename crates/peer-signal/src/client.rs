use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::{AuthParams, RelayConfig, SignallingOptions};
use crate::error::{SignalError, SignalResult};
use crate::ids::{ConnectionId, ConnectionType, PeerId};
use crate::protocol::{
    CandidatePayload, IceCandidate, MessageType, OfferPayload, SessionDescription,
    SignallingMessage,
};
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::transport::{spawn_heartbeat, InboundFrame, SignallingTransport};

/// A remote offer that passed validation and was registered.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingOffer {
    pub peer_id: PeerId,
    pub connection_id: ConnectionId,
    pub kind: ConnectionType,
    pub description: SessionDescription,
    pub label: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignallingEvent {
    Opened {
        peer_id: PeerId,
    },
    Error {
        reason: String,
    },
    /// The relay session ended. Emitted once per opened session.
    Closed,
    OfferReceived(IncomingOffer),
    AnswerReceived {
        peer_id: PeerId,
        connection_id: ConnectionId,
        description: SessionDescription,
    },
    CandidateReceived {
        peer_id: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    PeerLeft {
        peer_id: PeerId,
    },
}

struct PendingOffer {
    connection_id: ConnectionId,
    responder: oneshot::Sender<SignalResult<SessionDescription>>,
}

/// Everything that belongs to one relay session. Created by `connect`,
/// discarded as a unit when the session loop exits.
struct SessionState {
    peer_id: PeerId,
    auth: AuthParams,
    pending_offers: Mutex<HashMap<PeerId, PendingOffer>>,
    registry: ConnectionRegistry,
    outgoing: mpsc::UnboundedSender<SignallingMessage>,
    /// Held while an offer is announced, registered and queued, so candidates
    /// for it can never overtake it.
    offer_order: Mutex<()>,
    closing: AtomicBool,
    close_signal: Notify,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SessionState {
    fn new(auth: AuthParams, outgoing: mpsc::UnboundedSender<SignallingMessage>) -> Self {
        Self {
            peer_id: auth.id.clone(),
            auth,
            pending_offers: Mutex::new(HashMap::new()),
            registry: ConnectionRegistry::new(),
            outgoing,
            offer_order: Mutex::new(()),
            closing: AtomicBool::new(false),
            close_signal: Notify::new(),
            heartbeat: Mutex::new(None),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn request_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.close_signal.notify_one();
    }

    fn send(&self, message: SignallingMessage) -> SignalResult<()> {
        self.outgoing
            .send(message)
            .map_err(|_| SignalError::TransportClosed)
    }

    fn take_pending(&self, peer_id: &PeerId, connection_id: &ConnectionId) {
        let mut pending = self.pending_offers.lock();
        if pending
            .get(peer_id)
            .is_some_and(|offer| offer.connection_id == *connection_id)
        {
            pending.remove(peer_id);
        }
    }

    fn fail_pending(&self, peer_id: &PeerId, err: SignalError) -> bool {
        let offer = self.pending_offers.lock().remove(peer_id);
        match offer {
            Some(offer) => {
                let _ = offer.responder.send(Err(err));
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        // Dropping the responders wakes every waiter with TransportClosed.
        self.pending_offers.lock().clear();
    }
}

type SessionSlot = RwLock<Option<Arc<SessionState>>>;

/// Client side of the relay protocol.
///
/// Owns at most one relay session at a time and multiplexes every offer,
/// answer and candidate exchange of that session over it.
pub struct SignallingClient {
    relay: RelayConfig,
    options: SignallingOptions,
    http: reqwest::Client,
    slot: Arc<SessionSlot>,
    connect_lock: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<SignallingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignallingEvent>>>,
}

impl SignallingClient {
    pub fn new(relay: RelayConfig, options: SignallingOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::builder()
            .timeout(options.connect_timeout)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(target = "signalling", error = %err, "falling back to an untimed http client");
                reqwest::Client::new()
            });
        Self {
            relay,
            options,
            http,
            slot: Arc::new(RwLock::new(None)),
            connect_lock: tokio::sync::Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    /// The event stream of this client. Can be taken once.
    pub fn take_events(&self) -> SignalResult<mpsc::UnboundedReceiver<SignallingEvent>> {
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| SignalError::Setup("signalling events already taken".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|session| !session.is_closing())
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.slot.read().as_ref().map(|session| session.peer_id.clone())
    }

    /// Opens a relay session under `peer_id`, or under an id issued by the
    /// relay when none is given. Gives up with `ConnectTimeout` when the
    /// relay has not opened the session within the connect timeout.
    pub async fn connect(&self, peer_id: Option<PeerId>) -> SignalResult<PeerId> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            return Err(SignalError::AlreadyConnected);
        }

        let limit = self.options.connect_timeout;
        let (peer_id, auth, transport) = match tokio::time::timeout(limit, self.handshake(peer_id)).await {
            Ok(opened) => opened?,
            Err(_) => {
                tracing::warn!(target = "signalling", timeout = ?limit, "relay handshake timed out");
                return Err(SignalError::ConnectTimeout(limit));
            }
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let session = Arc::new(SessionState::new(auth, outgoing_tx.clone()));
        *session.heartbeat.lock() = Some(spawn_heartbeat(outgoing_tx, self.options.heartbeat_interval));
        *self.slot.write() = Some(Arc::clone(&session));

        tracing::info!(target = "signalling", peer = %peer_id, "relay session open");
        let _ = self.events_tx.send(SignallingEvent::Opened {
            peer_id: peer_id.clone(),
        });

        tokio::spawn(run_session(
            Arc::clone(&self.slot),
            session,
            transport,
            outgoing_rx,
            self.events_tx.clone(),
        ));
        Ok(peer_id)
    }

    /// Resolves the id, opens the socket and waits for the relay's first
    /// frame.
    async fn handshake(
        &self,
        peer_id: Option<PeerId>,
    ) -> SignalResult<(PeerId, AuthParams, SignallingTransport)> {
        let peer_id = match peer_id.filter(|id| !id.as_str().is_empty()) {
            Some(id) => id,
            None => self.request_id().await?,
        };
        let auth = AuthParams::new(self.relay.key.clone(), peer_id.clone());
        let url = self.relay.websocket_url(&auth)?;
        let mut transport = SignallingTransport::connect(&url).await?;

        let first = match transport.recv().await {
            Some(Ok(InboundFrame::Text(text))) => SignallingMessage::decode(&text),
            Some(Ok(InboundFrame::Binary(len))) => Err(SignalError::Protocol(format!(
                "relay opened with a {len} byte binary frame"
            ))),
            Some(Err(err)) => Err(err),
            None => Err(SignalError::TransportClosed),
        };
        if let Err(err) = first.and_then(|message| opening_outcome(&message)) {
            if let SignalError::Refused(reason) = &err {
                let _ = self.events_tx.send(SignallingEvent::Error {
                    reason: reason.clone(),
                });
            }
            tracing::warn!(target = "signalling", peer = %peer_id, error = %err, "relay session refused");
            transport.close().await;
            return Err(err);
        }
        Ok((peer_id, auth, transport))
    }

    /// Asks the session loop to stop. The `Closed` event follows once the
    /// relay socket has been shut down.
    pub fn disconnect(&self) -> SignalResult<()> {
        let session = self.session()?;
        tracing::debug!(target = "signalling", peer = %session.peer_id, "disconnect requested");
        session.request_close();
        Ok(())
    }

    /// Offers a media connection to `peer_id` and waits for its answer.
    /// `on_id` sees the new connection id before the offer leaves; it must not
    /// send through this client.
    pub async fn call(
        &self,
        peer_id: &PeerId,
        description: SessionDescription,
        on_id: impl FnOnce(&ConnectionId) + Send,
    ) -> SignalResult<SessionDescription> {
        self.send_offer(peer_id, description, ConnectionType::Media, on_id)
            .await
    }

    /// Offers a data connection to `peer_id` and waits for its answer.
    /// `on_id` sees the new connection id before the offer leaves; it must not
    /// send through this client.
    pub async fn exchange_data(
        &self,
        peer_id: &PeerId,
        description: SessionDescription,
        on_id: impl FnOnce(&ConnectionId) + Send,
    ) -> SignalResult<SessionDescription> {
        self.send_offer(peer_id, description, ConnectionType::Data, on_id)
            .await
    }

    pub fn answer(
        &self,
        connection_id: &ConnectionId,
        description: SessionDescription,
    ) -> SignalResult<()> {
        let session = self.session()?;
        let info = lookup(&session, connection_id)?;
        let payload = OfferPayload::new(description, info.kind, info.connection_id.clone());
        session.send(SignallingMessage::addressed(
            MessageType::Answer,
            &payload,
            &session.peer_id,
            &info.peer_id,
        )?)
    }

    pub fn send_candidate(
        &self,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) -> SignalResult<()> {
        let session = self.session()?;
        let _ordered = session.offer_order.lock();
        let info = lookup(&session, connection_id)?;
        let payload = CandidatePayload {
            candidate,
            kind: info.kind,
            connection_id: info.connection_id.clone(),
        };
        session.send(SignallingMessage::addressed(
            MessageType::Candidate,
            &payload,
            &session.peer_id,
            &info.peer_id,
        )?)
    }

    /// Drops a connection from the session registry, if a session is live.
    pub fn forget_connection(&self, peer_id: &PeerId, connection_id: &ConnectionId) {
        if let Some(session) = self.slot.read().as_ref() {
            session.registry.remove(peer_id, connection_id);
        }
    }

    pub fn connection_info(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.slot
            .read()
            .as_ref()
            .and_then(|session| session.registry.find_by_id(connection_id))
    }

    pub fn registered_connections(&self) -> usize {
        self.slot
            .read()
            .as_ref()
            .map_or(0, |session| session.registry.len())
    }

    /// Peers currently known to the relay, excluding this one.
    pub async fn active_peers(&self) -> SignalResult<Vec<PeerId>> {
        let session = self.session()?;
        let url = self.relay.peers_url(&session.auth)?;
        let peers: Vec<PeerId> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(peers
            .into_iter()
            .filter(|peer| *peer != session.peer_id)
            .collect())
    }

    async fn request_id(&self) -> SignalResult<PeerId> {
        let url = self.relay.id_url()?;
        let id = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let id = id.trim();
        if id.is_empty() {
            return Err(SignalError::Protocol("relay issued an empty id".into()));
        }
        tracing::debug!(target = "signalling", peer = %id, "relay issued id");
        Ok(PeerId::new(id))
    }

    fn session(&self) -> SignalResult<Arc<SessionState>> {
        self.slot
            .read()
            .as_ref()
            .filter(|session| !session.is_closing())
            .cloned()
            .ok_or(SignalError::NotConnected)
    }

    async fn send_offer(
        &self,
        peer_id: &PeerId,
        description: SessionDescription,
        kind: ConnectionType,
        on_id: impl FnOnce(&ConnectionId) + Send,
    ) -> SignalResult<SessionDescription> {
        let session = self.session()?;
        let connection_id = ConnectionId::generate(kind);
        let (responder, answer) = oneshot::channel();
        {
            let mut pending = session.pending_offers.lock();
            match pending.entry(peer_id.clone()) {
                Entry::Occupied(_) => return Err(SignalError::OfferPending(peer_id.clone())),
                Entry::Vacant(slot) => {
                    slot.insert(PendingOffer {
                        connection_id: connection_id.clone(),
                        responder,
                    });
                }
            }
        }

        let sent = {
            let _ordered = session.offer_order.lock();
            on_id(&connection_id);
            session
                .registry
                .save(peer_id, &connection_id, kind)
                .and_then(|_| {
                    let payload = OfferPayload::new(description, kind, connection_id.clone());
                    SignallingMessage::addressed(MessageType::Offer, &payload, &session.peer_id, peer_id)
                })
                .and_then(|message| session.send(message))
        };
        if let Err(err) = sent {
            session.take_pending(peer_id, &connection_id);
            if !matches!(err, SignalError::DuplicateConnection(_)) {
                session.registry.remove(peer_id, &connection_id);
            }
            return Err(err);
        }
        tracing::debug!(
            target = "signalling",
            peer = %peer_id,
            connection_id = %connection_id,
            kind = %kind,
            "offer sent"
        );

        let outcome = match tokio::time::timeout(self.options.offer_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalError::TransportClosed),
            Err(_) => Err(SignalError::Timeout {
                peer: peer_id.clone(),
                timeout: self.options.offer_timeout,
            }),
        };
        session.take_pending(peer_id, &connection_id);
        if let Err(err) = &outcome {
            tracing::warn!(
                target = "signalling",
                peer = %peer_id,
                connection_id = %connection_id,
                error = %err,
                "offer failed"
            );
            session.registry.remove(peer_id, &connection_id);
        }
        outcome
    }
}

fn lookup(session: &SessionState, connection_id: &ConnectionId) -> SignalResult<ConnectionInfo> {
    session
        .registry
        .find_by_id(connection_id)
        .ok_or_else(|| SignalError::UnknownConnection(connection_id.clone()))
}

/// The first frame of a session decides whether the relay accepted us.
fn opening_outcome(message: &SignallingMessage) -> SignalResult<()> {
    match message.kind {
        MessageType::Open => Ok(()),
        MessageType::Error => Err(SignalError::Refused(message.reason("unknown"))),
        MessageType::IdTaken => Err(SignalError::Refused(message.reason("ID already taken"))),
        MessageType::InvalidKey => Err(SignalError::Refused(message.reason("Invalid key"))),
        other => Err(SignalError::Protocol(format!(
            "relay opened with {other:?} instead of OPEN"
        ))),
    }
}

async fn run_session(
    slot: Arc<SessionSlot>,
    session: Arc<SessionState>,
    mut transport: SignallingTransport,
    mut outgoing: mpsc::UnboundedReceiver<SignallingMessage>,
    events: mpsc::UnboundedSender<SignallingEvent>,
) {
    loop {
        if session.is_closing() {
            break;
        }
        tokio::select! {
            biased;
            _ = session.close_signal.notified() => break,
            Some(message) = outgoing.recv() => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "signalling", error = %err, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(err) = transport.send_text(text).await {
                    tracing::warn!(target = "signalling", error = %err, "relay send failed");
                    break;
                }
            }
            frame = transport.recv() => match frame {
                Some(Ok(InboundFrame::Text(text))) => dispatch(&session, &text, &events),
                Some(Ok(InboundFrame::Binary(len))) => {
                    tracing::debug!(target = "signalling", len, "ignoring binary frame");
                }
                Some(Err(err)) => {
                    tracing::warn!(target = "signalling", error = %err, "relay receive failed");
                    break;
                }
                None => {
                    tracing::debug!(target = "signalling", "relay closed the session");
                    break;
                }
            },
        }
    }

    transport.close().await;
    {
        let mut current = slot.write();
        if current
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, &session))
        {
            *current = None;
        }
    }
    session.shutdown();
    tracing::info!(target = "signalling", peer = %session.peer_id, "relay session closed");
    let _ = events.send(SignallingEvent::Closed);
}

fn dispatch(session: &SessionState, text: &str, events: &mpsc::UnboundedSender<SignallingEvent>) {
    let message = match SignallingMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(target = "signalling", error = %err, "dropping malformed frame");
            return;
        }
    };
    let handled = match message.kind {
        MessageType::Offer => on_offer(session, &message, events),
        MessageType::Answer => on_answer(session, &message, events),
        MessageType::Candidate => on_candidate(session, &message, events),
        MessageType::Leave => on_leave(session, &message, events),
        MessageType::Expire => on_expire(session, &message),
        MessageType::Error => {
            let reason = message.reason("unknown");
            tracing::warn!(target = "signalling", %reason, "relay reported an error");
            let _ = events.send(SignallingEvent::Error { reason });
            Ok(())
        }
        MessageType::Heartbeat | MessageType::Open | MessageType::IdTaken | MessageType::InvalidKey => {
            tracing::debug!(target = "signalling", kind = ?message.kind, "ignoring frame mid-session");
            Ok(())
        }
    };
    if let Err(err) = handled {
        tracing::warn!(
            target = "signalling",
            kind = ?message.kind,
            src = ?message.src,
            error = %err,
            "dropping signalling message"
        );
    }
}

fn on_offer(
    session: &SessionState,
    message: &SignallingMessage,
    events: &mpsc::UnboundedSender<SignallingEvent>,
) -> SignalResult<()> {
    let peer_id = message.source()?.clone();
    let payload: OfferPayload = message.payload_as()?;
    payload.ensure_supported()?;
    session
        .registry
        .save(&peer_id, &payload.connection_id, payload.kind)?;
    tracing::debug!(
        target = "signalling",
        peer = %peer_id,
        connection_id = %payload.connection_id,
        kind = %payload.kind,
        "offer received"
    );
    let _ = events.send(SignallingEvent::OfferReceived(IncomingOffer {
        peer_id,
        connection_id: payload.connection_id,
        kind: payload.kind,
        description: payload.sdp,
        label: payload.data.label,
        metadata: payload.data.metadata,
    }));
    Ok(())
}

fn on_answer(
    session: &SessionState,
    message: &SignallingMessage,
    events: &mpsc::UnboundedSender<SignallingEvent>,
) -> SignalResult<()> {
    let peer_id = message.source()?.clone();
    let payload: OfferPayload = message.payload_as()?;
    let pending = {
        let mut pending = session.pending_offers.lock();
        let expected = pending
            .get(&peer_id)
            .map(|offer| offer.connection_id.clone());
        match expected {
            Some(expected) if expected == payload.connection_id => pending.remove(&peer_id),
            Some(expected) => {
                return Err(SignalError::Protocol(format!(
                    "answer for {} while {expected} is pending",
                    payload.connection_id
                )))
            }
            None => None,
        }
    };
    match pending {
        Some(offer) => {
            let _ = offer.responder.send(Ok(payload.sdp.clone()));
        }
        None => tracing::debug!(
            target = "signalling",
            peer = %peer_id,
            connection_id = %payload.connection_id,
            "answer arrived without a pending offer"
        ),
    }
    let _ = events.send(SignallingEvent::AnswerReceived {
        peer_id,
        connection_id: payload.connection_id,
        description: payload.sdp,
    });
    Ok(())
}

fn on_candidate(
    session: &SessionState,
    message: &SignallingMessage,
    events: &mpsc::UnboundedSender<SignallingEvent>,
) -> SignalResult<()> {
    let peer_id = message.source()?.clone();
    let payload: CandidatePayload = message.payload_as()?;
    if !session.registry.contains(&peer_id, &payload.connection_id) {
        return Err(SignalError::UnknownConnection(payload.connection_id));
    }
    let _ = events.send(SignallingEvent::CandidateReceived {
        peer_id,
        connection_id: payload.connection_id,
        candidate: payload.candidate,
    });
    Ok(())
}

fn on_leave(
    session: &SessionState,
    message: &SignallingMessage,
    events: &mpsc::UnboundedSender<SignallingEvent>,
) -> SignalResult<()> {
    let peer_id = message.source()?.clone();
    let evicted = session.registry.remove_peer(&peer_id);
    session.fail_pending(&peer_id, SignalError::Rejected(format!("{peer_id} left the relay")));
    tracing::info!(target = "signalling", peer = %peer_id, evicted = evicted.len(), "peer left");
    let _ = events.send(SignallingEvent::PeerLeft { peer_id });
    Ok(())
}

fn on_expire(session: &SessionState, message: &SignallingMessage) -> SignalResult<()> {
    let peer_id = message.source()?;
    if !session.fail_pending(peer_id, SignalError::Rejected("offer expired".into())) {
        tracing::debug!(target = "signalling", peer = %peer_id, "expiry without a pending offer");
    }
    Ok(())
}
