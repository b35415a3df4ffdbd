//! Application-facing connection manager.
//!
//! A single context task creates the `webrtc` API object and owns every peer
//! connection made from it, keyed by [`ConnectionKey`]. Handles given to the
//! application only carry keys and ids; negotiation steps and disposal are
//! sent to the context task as commands, so native resources are always
//! torn down by the task that created them.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::channel::{DataChannelMultiplexer, ExchangeChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::client::{IncomingOffer, SignallingClient, SignallingEvent};
use crate::error::{SignalError, SignalResult};
use crate::ids::{random_token, ConnectionId, ConnectionType, PeerId};
use crate::media::{MediaTracks, RemoteTrackInfo};
use crate::negotiation::NegotiationSession;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::rtc::{self, ConnectionKey, PeerEvent, PeerEventKind, RtcFactory};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub ice_servers: Vec<String>,
    /// How long an incoming offer may wait for accept/reject before it is
    /// rejected.
    pub decision_timeout: Duration,
    pub channel_capacity: usize,
    /// Offer loopback host candidates as well.
    pub include_loopback: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            include_loopback: false,
        }
    }
}

pub enum ClientEvent {
    SignallingOpened {
        peer_id: PeerId,
    },
    SignallingError {
        reason: String,
    },
    SignallingClosed,
    DataRequest(IncomingRequest<DataConnection>),
    CallRequest(IncomingRequest<MediaConnection>),
    ConnectionClosed {
        peer_id: PeerId,
        connection_id: Option<ConnectionId>,
        kind: ConnectionType,
    },
    PeerLeft {
        peer_id: PeerId,
    },
}

/// A remote offer waiting for the application's decision. Dropping the
/// request rejects it.
pub struct IncomingRequest<C> {
    peer_id: PeerId,
    connection_id: ConnectionId,
    label: Option<String>,
    metadata: Option<Value>,
    connection: C,
    responder: oneshot::Sender<bool>,
}

impl<C> IncomingRequest<C> {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn accept(self) -> C {
        let _ = self.responder.send(true);
        self.connection
    }

    pub fn reject(self) {
        let _ = self.responder.send(false);
    }
}

struct ConnectionHandle {
    key: ConnectionKey,
    peer_id: PeerId,
    connection_id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    fn close(&self) {
        let _ = self.commands.send(Command::Close {
            key: self.key,
            reason: "closed by application",
        });
    }
}

pub struct DataConnection {
    handle: ConnectionHandle,
    exchanges: mpsc::UnboundedReceiver<ExchangeChannel>,
}

impl DataConnection {
    pub fn peer_id(&self) -> &PeerId {
        &self.handle.peer_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.handle.connection_id
    }

    /// Next channel opened on this connection, `None` once it has closed.
    pub async fn next_exchange(&mut self) -> Option<ExchangeChannel> {
        self.exchanges.recv().await
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

pub struct MediaConnection {
    handle: ConnectionHandle,
    tracks: mpsc::UnboundedReceiver<RemoteTrackInfo>,
}

impl MediaConnection {
    pub fn peer_id(&self) -> &PeerId {
        &self.handle.peer_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.handle.connection_id
    }

    /// Next remote video track, `None` once the connection has closed.
    pub async fn next_video_track(&mut self) -> Option<RemoteTrackInfo> {
        self.tracks.recv().await
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

#[derive(Debug, Default)]
struct ActiveConnections {
    data: AtomicUsize,
    media: AtomicUsize,
}

impl ActiveConnections {
    fn counter(&self, kind: ConnectionType) -> &AtomicUsize {
        match kind {
            ConnectionType::Data => &self.data,
            ConnectionType::Media => &self.media,
        }
    }

    fn add(&self, kind: ConnectionType) {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self, kind: ConnectionType) {
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn count(&self, kind: Option<ConnectionType>) -> usize {
        match kind {
            Some(kind) => self.counter(kind).load(Ordering::Acquire),
            None => self.data.load(Ordering::Acquire) + self.media.load(Ordering::Acquire),
        }
    }
}

enum Command {
    Create {
        peer_id: PeerId,
        kind: ConnectionType,
        label: Option<String>,
        reply: oneshot::Sender<SignalResult<Created>>,
    },
    CreateOffer {
        key: ConnectionKey,
        reply: oneshot::Sender<SignalResult<SessionDescription>>,
    },
    AssignId {
        key: ConnectionKey,
        connection_id: ConnectionId,
    },
    ApplyAnswer {
        key: ConnectionKey,
        answer: SessionDescription,
        reply: oneshot::Sender<SignalResult<()>>,
    },
    Decided {
        key: ConnectionKey,
        offer: SessionDescription,
        accepted: bool,
    },
    SetLocalTracks(Vec<LocalTrack>),
    Close {
        key: ConnectionKey,
        reason: &'static str,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Created {
    Data {
        key: ConnectionKey,
        exchanges: mpsc::UnboundedReceiver<ExchangeChannel>,
    },
    Media {
        key: ConnectionKey,
        tracks: mpsc::UnboundedReceiver<RemoteTrackInfo>,
    },
}

impl Created {
    fn key(&self) -> ConnectionKey {
        match self {
            Created::Data { key, .. } | Created::Media { key, .. } => *key,
        }
    }
}

/// Creates, negotiates and disposes peer connections on behalf of the
/// application, on top of one [`SignallingClient`].
pub struct PeerManager {
    signalling: Arc<SignallingClient>,
    commands: mpsc::UnboundedSender<Command>,
    active: Arc<ActiveConnections>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    context: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Takes over the client's event stream and starts the context task.
    pub async fn start(signalling: Arc<SignallingClient>, options: ManagerOptions) -> SignalResult<Self> {
        let signalling_events = signalling.take_events()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let active = Arc::new(ActiveConnections::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        let setup = ContextSetup {
            signalling: Arc::clone(&signalling),
            options,
            commands_tx: commands_tx.clone(),
            events: events_tx,
            active: Arc::clone(&active),
        };
        let context = tokio::spawn(run_context(setup, commands_rx, signalling_events, ready_tx));
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(SignalError::Setup("rtc context exited during startup".into())),
        }

        Ok(Self {
            signalling,
            commands: commands_tx,
            active,
            events: Mutex::new(Some(events_rx)),
            context: Mutex::new(Some(context)),
        })
    }

    pub fn signalling(&self) -> &Arc<SignallingClient> {
        &self.signalling
    }

    /// The event stream of this manager. Can be taken once.
    pub fn events(&self) -> SignalResult<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| SignalError::Setup("client events already taken".into()))
    }

    pub async fn connect(&self, peer_id: Option<PeerId>) -> SignalResult<PeerId> {
        self.signalling.connect(peer_id).await
    }

    pub fn disconnect(&self) -> SignalResult<()> {
        self.signalling.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.signalling.is_connected()
    }

    pub async fn active_peers(&self) -> SignalResult<Vec<PeerId>> {
        self.signalling.active_peers().await
    }

    /// Live connections of `kind`, or of every kind.
    pub fn active_connections(&self, kind: Option<ConnectionType>) -> usize {
        self.active.count(kind)
    }

    /// Local media attached to every media connection created from now on.
    pub fn set_local_tracks(&self, tracks: Vec<LocalTrack>) {
        let _ = self.commands.send(Command::SetLocalTracks(tracks));
    }

    /// Opens a data connection to `peer_id` with one channel named `label`.
    pub async fn exchange_data(&self, peer_id: &PeerId, label: Option<String>) -> SignalResult<DataConnection> {
        let label = label.unwrap_or_else(random_token);
        let created = self
            .request(|reply| Command::Create {
                peer_id: peer_id.clone(),
                kind: ConnectionType::Data,
                label: Some(label),
                reply,
            })
            .await?;
        match created {
            Created::Data { key, exchanges } => {
                let handle = self.negotiate(key, peer_id, ConnectionType::Data).await?;
                Ok(DataConnection { handle, exchanges })
            }
            other => Err(self.discard(other.key())),
        }
    }

    /// Places a media call to `peer_id`.
    pub async fn call(&self, peer_id: &PeerId) -> SignalResult<MediaConnection> {
        let created = self
            .request(|reply| Command::Create {
                peer_id: peer_id.clone(),
                kind: ConnectionType::Media,
                label: None,
                reply,
            })
            .await?;
        match created {
            Created::Media { key, tracks } => {
                let handle = self.negotiate(key, peer_id, ConnectionType::Media).await?;
                Ok(MediaConnection { handle, tracks })
            }
            other => Err(self.discard(other.key())),
        }
    }

    /// Closes every connection and stops the context task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        let context = self.context.lock().take();
        if let Some(context) = context {
            let _ = context.await;
        }
    }

    fn discard(&self, key: ConnectionKey) -> SignalError {
        let _ = self.commands.send(Command::Close {
            key,
            reason: "unexpected connection kind",
        });
        SignalError::Negotiation("context created the wrong connection kind".into())
    }

    async fn negotiate(
        &self,
        key: ConnectionKey,
        peer_id: &PeerId,
        kind: ConnectionType,
    ) -> SignalResult<ConnectionHandle> {
        match self.offer(key, peer_id, kind).await {
            Ok(connection_id) => Ok(ConnectionHandle {
                key,
                peer_id: peer_id.clone(),
                connection_id,
                commands: self.commands.clone(),
            }),
            Err(err) => {
                tracing::warn!(target = "rtc", peer = %peer_id, kind = %kind, error = %err, "negotiation failed");
                let _ = self.commands.send(Command::Close {
                    key,
                    reason: "negotiation failed",
                });
                Err(err)
            }
        }
    }

    async fn offer(&self, key: ConnectionKey, peer_id: &PeerId, kind: ConnectionType) -> SignalResult<ConnectionId> {
        let offer = self
            .request(|reply| Command::CreateOffer { key, reply })
            .await?;

        let assigned = Arc::new(Mutex::new(None::<ConnectionId>));
        let on_id = {
            let assigned = Arc::clone(&assigned);
            let commands = self.commands.clone();
            move |connection_id: &ConnectionId| {
                *assigned.lock() = Some(connection_id.clone());
                let _ = commands.send(Command::AssignId {
                    key,
                    connection_id: connection_id.clone(),
                });
            }
        };
        let answer = match kind {
            ConnectionType::Data => self.signalling.exchange_data(peer_id, offer, on_id).await?,
            ConnectionType::Media => self.signalling.call(peer_id, offer, on_id).await?,
        };

        self.request(|reply| Command::ApplyAnswer { key, answer, reply })
            .await?;
        let connection_id = assigned.lock().take();
        connection_id.ok_or_else(|| SignalError::Protocol("connection id was never assigned".into()))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SignalResult<T>>) -> Command,
    ) -> SignalResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SignalError::Setup("rtc context stopped".into()))?;
        response
            .await
            .map_err(|_| SignalError::Setup("rtc context stopped".into()))?
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        if let Some(context) = self.context.lock().take() {
            context.abort();
        }
    }
}

struct ContextSetup {
    signalling: Arc<SignallingClient>,
    options: ManagerOptions,
    commands_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    active: Arc<ActiveConnections>,
}

enum ConnectionDetail {
    Data(DataChannelMultiplexer),
    Media(MediaTracks),
}

struct ManagedConnection {
    peer_id: PeerId,
    kind: ConnectionType,
    connection_id: Option<ConnectionId>,
    pc: Arc<RTCPeerConnection>,
    negotiation: NegotiationSession,
    detail: ConnectionDetail,
    data_channels: Vec<Arc<RTCDataChannel>>,
    local_senders: Vec<Arc<RTCRtpSender>>,
}

impl ManagedConnection {
    async fn detach_local_media(&mut self) {
        for sender in self.local_senders.drain(..) {
            if let Err(err) = self.pc.remove_track(&sender).await {
                tracing::debug!(target = "rtc", error = %err, "detaching local track");
            }
        }
    }

    /// Negotiation buffers first, then the variant's helpers, then the
    /// native connection itself.
    async fn release(mut self) {
        self.negotiation.close();
        match &mut self.detail {
            ConnectionDetail::Data(mux) => mux.close_all(),
            ConnectionDetail::Media(tracks) => tracks.release(),
        }
        for dc in self.data_channels.drain(..) {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "rtc", error = %err, "closing data channel");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "rtc", error = %err, "closing peer connection");
        }
    }
}

async fn run_context(
    setup: ContextSetup,
    commands: mpsc::UnboundedReceiver<Command>,
    signalling_events: mpsc::UnboundedReceiver<SignallingEvent>,
    ready: oneshot::Sender<SignalResult<()>>,
) {
    let factory = match RtcFactory::new(&setup.options.ice_servers, setup.options.include_loopback) {
        Ok(factory) => factory,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let context = RtcContext {
        factory,
        signalling: setup.signalling,
        options: setup.options,
        commands: setup.commands_tx,
        events: setup.events,
        active: setup.active,
        peer_events: peer_tx,
        connections: HashMap::new(),
        local_tracks: Vec::new(),
        next_key: 1,
    };
    context.run(commands, peer_rx, signalling_events).await;
}

struct RtcContext {
    factory: RtcFactory,
    signalling: Arc<SignallingClient>,
    options: ManagerOptions,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    active: Arc<ActiveConnections>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    connections: HashMap<ConnectionKey, ManagedConnection>,
    local_tracks: Vec<LocalTrack>,
    next_key: u64,
}

fn entry(
    connections: &mut HashMap<ConnectionKey, ManagedConnection>,
    key: ConnectionKey,
) -> SignalResult<&mut ManagedConnection> {
    connections
        .get_mut(&key)
        .ok_or_else(|| SignalError::Negotiation("connection already closed".into()))
}

impl RtcContext {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut signalling_events: mpsc::UnboundedReceiver<SignallingEvent>,
    ) {
        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                Some(event) = signalling_events.recv() => self.handle_signalling_event(event).await,
                else => break,
            }
        }
        tracing::debug!(target = "rtc", "rtc context stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Create {
                peer_id,
                kind,
                label,
                reply,
            } => {
                let created = self.create(peer_id, kind, None, label).await;
                if let Err(Ok(orphan)) = reply.send(created) {
                    self.close_connection(orphan.key(), "requester went away").await;
                }
            }
            Command::CreateOffer { key, reply } => {
                let _ = reply.send(self.create_offer(key).await);
            }
            Command::AssignId { key, connection_id } => self.assign_id(key, connection_id).await,
            Command::ApplyAnswer { key, answer, reply } => {
                let _ = reply.send(self.apply_answer(key, answer).await);
            }
            Command::Decided {
                key,
                offer,
                accepted,
            } => {
                if !accepted {
                    self.close_connection(key, "offer declined").await;
                } else if let Err(err) = self.accept_offer(key, offer).await {
                    tracing::warn!(target = "rtc", key = key.0, error = %err, "answering offer failed");
                    self.close_connection(key, "answer failed").await;
                }
            }
            Command::SetLocalTracks(tracks) => self.local_tracks = tracks,
            Command::Close { key, reason } => self.close_connection(key, reason).await,
            Command::Shutdown { reply } => {
                self.close_all().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn create(
        &mut self,
        peer_id: PeerId,
        kind: ConnectionType,
        connection_id: Option<ConnectionId>,
        label: Option<String>,
    ) -> SignalResult<Created> {
        let key = ConnectionKey(self.next_key);
        self.next_key += 1;

        let (detail, created) = match kind {
            ConnectionType::Data => {
                let (mux, exchanges) = DataChannelMultiplexer::new(self.options.channel_capacity);
                (ConnectionDetail::Data(mux), Created::Data { key, exchanges })
            }
            ConnectionType::Media => {
                let (tracks, announced) = MediaTracks::new();
                (
                    ConnectionDetail::Media(tracks),
                    Created::Media {
                        key,
                        tracks: announced,
                    },
                )
            }
        };
        let inbound_mux = match &detail {
            ConnectionDetail::Data(mux) => Some(mux.clone()),
            ConnectionDetail::Media(_) => None,
        };
        let pc = self
            .factory
            .create(key, self.peer_events.clone(), inbound_mux)
            .await?;

        let outgoing = connection_id.is_none();
        let mut connection = ManagedConnection {
            peer_id,
            kind,
            negotiation: NegotiationSession::new(!outgoing),
            connection_id,
            pc,
            detail,
            data_channels: Vec::new(),
            local_senders: Vec::new(),
        };

        if let Err(err) = self.prepare(&mut connection, outgoing, label.as_deref()).await {
            connection.detach_local_media().await;
            connection.release().await;
            return Err(err);
        }

        tracing::debug!(
            target = "rtc",
            key = key.0,
            peer = %connection.peer_id,
            kind = %kind,
            "peer connection created"
        );
        self.active.add(kind);
        self.connections.insert(key, connection);
        Ok(created)
    }

    async fn prepare(
        &self,
        connection: &mut ManagedConnection,
        outgoing: bool,
        label: Option<&str>,
    ) -> SignalResult<()> {
        match &connection.detail {
            ConnectionDetail::Data(mux) => {
                if let Some(label) = label.filter(|_| outgoing) {
                    let dc = rtc::open_data_channel(&connection.pc, label).await?;
                    rtc::bind_data_channel(&dc, mux.clone());
                    connection.data_channels.push(dc);
                }
            }
            ConnectionDetail::Media(_) => {
                for track in &self.local_tracks {
                    let sender = connection.pc.add_track(Arc::clone(track)).await?;
                    connection.local_senders.push(sender);
                }
                if outgoing && self.local_tracks.is_empty() {
                    rtc::add_receive_transceivers(&connection.pc).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_offer(&mut self, key: ConnectionKey) -> SignalResult<SessionDescription> {
        let connection = entry(&mut self.connections, key)?;
        let offer = rtc::create_offer(&connection.pc).await?;
        connection.negotiation.offer_created(offer.clone())?;
        Ok(offer)
    }

    async fn assign_id(&mut self, key: ConnectionKey, connection_id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&key) else {
            tracing::debug!(target = "rtc", key = key.0, "id assigned to a closed connection");
            return;
        };
        connection.connection_id = Some(connection_id);
        if let Err(err) = connection.negotiation.offer_sent() {
            tracing::debug!(target = "rtc", key = key.0, error = %err, "offer bookkeeping");
        }
        let flush = connection.negotiation.mark_addressable();
        self.flush_candidates(key, flush).await;
    }

    async fn apply_answer(&mut self, key: ConnectionKey, answer: SessionDescription) -> SignalResult<()> {
        let connection = entry(&mut self.connections, key)?;
        rtc::apply_answer(&connection.pc, &answer).await?;
        let early = connection.negotiation.answer_received(answer)?;
        apply_remote_candidates(&connection.pc, early).await;
        Ok(())
    }

    async fn accept_offer(&mut self, key: ConnectionKey, offer: SessionDescription) -> SignalResult<()> {
        let connection = entry(&mut self.connections, key)?;
        let connection_id = connection
            .connection_id
            .clone()
            .ok_or_else(|| SignalError::Negotiation("incoming connection without id".into()))?;

        let answer = rtc::answer_offer(&connection.pc, &offer).await?;
        let early = connection.negotiation.offer_received(offer)?;
        connection.negotiation.answer_created(answer.clone())?;
        apply_remote_candidates(&connection.pc, early).await;

        self.signalling.answer(&connection_id, answer)?;
        connection.negotiation.answer_sent()?;
        tracing::info!(
            target = "rtc",
            peer = %connection.peer_id,
            connection_id = %connection_id,
            "offer answered"
        );
        Ok(())
    }

    /// Sends buffered local candidates, oldest first. Each one is also
    /// applied to the local connection before it goes out.
    async fn flush_candidates(&self, key: ConnectionKey, candidates: Vec<IceCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let Some(connection) = self.connections.get(&key) else {
            return;
        };
        let Some(connection_id) = connection.connection_id.as_ref() else {
            return;
        };
        tracing::debug!(
            target = "rtc",
            connection_id = %connection_id,
            count = candidates.len(),
            "flushing local candidates"
        );
        for candidate in candidates {
            if let Err(err) = rtc::add_candidate(&connection.pc, &candidate).await {
                tracing::trace!(target = "rtc", error = %err, "local candidate not applied");
            }
            if let Err(err) = self.signalling.send_candidate(connection_id, candidate) {
                tracing::warn!(target = "rtc", connection_id = %connection_id, error = %err, "candidate not sent");
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { key, kind } = event;
        let Some(connection) = self.connections.get_mut(&key) else {
            tracing::trace!(target = "rtc", key = key.0, "event for a closed connection");
            return;
        };
        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                connection.negotiation.buffer_local_candidate(candidate);
            }
            PeerEventKind::GatheringChanged(state) => {
                let flush = connection.negotiation.gathering_changed(state);
                self.flush_candidates(key, flush).await;
            }
            PeerEventKind::IceConnectionChanged(state) => {
                if connection.negotiation.ice_connection_changed(state) {
                    self.close_connection(key, "ice connection lost").await;
                }
            }
            PeerEventKind::DataChannel(dc) => match &connection.detail {
                // Already bound when the channel was announced.
                ConnectionDetail::Data(_) => connection.data_channels.push(dc),
                ConnectionDetail::Media(_) => {
                    tracing::warn!(target = "rtc", key = key.0, "data channel on a media connection");
                    let _ = dc.close().await;
                }
            },
            PeerEventKind::TrackAdded(track) => match &mut connection.detail {
                ConnectionDetail::Media(tracks) => tracks.track_added(track),
                ConnectionDetail::Data(_) => {
                    tracing::debug!(target = "rtc", key = key.0, "ignoring track on a data connection");
                }
            },
        }
    }

    async fn handle_signalling_event(&mut self, event: SignallingEvent) {
        match event {
            SignallingEvent::Opened { peer_id } => {
                let _ = self.events.send(ClientEvent::SignallingOpened { peer_id });
            }
            SignallingEvent::Error { reason } => {
                let _ = self.events.send(ClientEvent::SignallingError { reason });
            }
            SignallingEvent::Closed => {
                let _ = self.events.send(ClientEvent::SignallingClosed);
            }
            SignallingEvent::OfferReceived(offer) => self.incoming_offer(offer).await,
            SignallingEvent::AnswerReceived { connection_id, .. } => {
                tracing::trace!(target = "rtc", connection_id = %connection_id, "answer observed");
            }
            SignallingEvent::CandidateReceived {
                peer_id,
                connection_id,
                candidate,
            } => self.remote_candidate(&peer_id, &connection_id, candidate).await,
            SignallingEvent::PeerLeft { peer_id } => {
                let owned: Vec<ConnectionKey> = self
                    .connections
                    .iter()
                    .filter(|(_, connection)| connection.peer_id == peer_id)
                    .map(|(key, _)| *key)
                    .collect();
                for key in owned {
                    self.close_connection(key, "peer left").await;
                }
                let _ = self.events.send(ClientEvent::PeerLeft { peer_id });
            }
        }
    }

    async fn incoming_offer(&mut self, offer: IncomingOffer) {
        if self.find(&offer.connection_id).is_some() {
            tracing::warn!(target = "rtc", connection_id = %offer.connection_id, "duplicate offer ignored");
            return;
        }
        let created = match self
            .create(
                offer.peer_id.clone(),
                offer.kind,
                Some(offer.connection_id.clone()),
                None,
            )
            .await
        {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(
                    target = "rtc",
                    peer = %offer.peer_id,
                    connection_id = %offer.connection_id,
                    error = %err,
                    "could not create connection for offer"
                );
                self.signalling
                    .forget_connection(&offer.peer_id, &offer.connection_id);
                return;
            }
        };

        let key = created.key();
        let (responder, decision) = oneshot::channel();
        let handle = ConnectionHandle {
            key,
            peer_id: offer.peer_id.clone(),
            connection_id: offer.connection_id.clone(),
            commands: self.commands.clone(),
        };
        let event = match created {
            Created::Data { exchanges, .. } => ClientEvent::DataRequest(IncomingRequest {
                peer_id: offer.peer_id,
                connection_id: offer.connection_id,
                label: offer.label,
                metadata: offer.metadata,
                connection: DataConnection { handle, exchanges },
                responder,
            }),
            Created::Media { tracks, .. } => ClientEvent::CallRequest(IncomingRequest {
                peer_id: offer.peer_id,
                connection_id: offer.connection_id,
                label: offer.label,
                metadata: offer.metadata,
                connection: MediaConnection { handle, tracks },
                responder,
            }),
        };
        if self.events.send(event).is_err() {
            self.close_connection(key, "no application listening").await;
            return;
        }

        let commands = self.commands.clone();
        let timeout = self.options.decision_timeout;
        let description = offer.description;
        tokio::spawn(async move {
            let accepted = match tokio::time::timeout(timeout, decision).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(_)) => false,
                Err(_) => {
                    tracing::warn!(target = "rtc", key = key.0, ?timeout, "offer left undecided, rejecting");
                    false
                }
            };
            let _ = commands.send(Command::Decided {
                key,
                offer: description,
                accepted,
            });
        });
    }

    async fn remote_candidate(&mut self, peer_id: &PeerId, connection_id: &ConnectionId, candidate: IceCandidate) {
        let Some(key) = self.find(connection_id) else {
            tracing::warn!(target = "rtc", connection_id = %connection_id, "candidate for unknown connection");
            return;
        };
        let Some(connection) = self.connections.get_mut(&key) else {
            return;
        };
        if connection.peer_id != *peer_id {
            tracing::warn!(target = "rtc", connection_id = %connection_id, peer = %peer_id, "candidate from the wrong peer");
            return;
        }
        if let Some(candidate) = connection.negotiation.accept_remote_candidate(candidate) {
            if let Err(err) = rtc::add_candidate(&connection.pc, &candidate).await {
                tracing::warn!(target = "rtc", connection_id = %connection_id, error = %err, "remote candidate rejected");
            }
        }
    }

    fn find(&self, connection_id: &ConnectionId) -> Option<ConnectionKey> {
        self.connections
            .iter()
            .find(|(_, connection)| connection.connection_id.as_ref() == Some(connection_id))
            .map(|(key, _)| *key)
    }

    /// Unbinds the connection (local media, registry, counters) and then
    /// releases everything it holds.
    async fn close_connection(&mut self, key: ConnectionKey, reason: &str) {
        let Some(mut connection) = self.connections.remove(&key) else {
            tracing::trace!(target = "rtc", key = key.0, "connection already closed");
            return;
        };
        tracing::info!(
            target = "rtc",
            peer = %connection.peer_id,
            connection_id = ?connection.connection_id,
            reason,
            "closing connection"
        );

        connection.detach_local_media().await;
        if let Some(connection_id) = &connection.connection_id {
            self.signalling
                .forget_connection(&connection.peer_id, connection_id);
        }
        self.active.remove(connection.kind);
        let _ = self.events.send(ClientEvent::ConnectionClosed {
            peer_id: connection.peer_id.clone(),
            connection_id: connection.connection_id.clone(),
            kind: connection.kind,
        });

        connection.release().await;
    }

    async fn close_all(&mut self) {
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            self.close_connection(key, "shutting down").await;
        }
    }
}

async fn apply_remote_candidates(pc: &RTCPeerConnection, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        if let Err(err) = rtc::add_candidate(pc, &candidate).await {
            tracing::warn!(target = "rtc", error = %err, "buffered remote candidate rejected");
        }
    }
}
