use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use peer_signal::{
    ClientEvent, ConnectionId, ConnectionSupervisor, ConnectionType, DataConnection,
    ManagerOptions, MediaConnection, PeerId, PeerManager, Reconnect, ReconnectOutcome,
    ReconnectPolicy, ReconnectTrigger, SignallingClient, SignallingOptions,
};

use crate::assistance::{parse_instruction, present};
use crate::backend::BackendClient;
use crate::config::{AppConfig, PeerInfo};

/// Connections this client agreed to, at most one per kind.
#[derive(Debug, Default)]
struct AcceptedConnections {
    inner: Mutex<HashMap<ConnectionId, ConnectionType>>,
}

impl AcceptedConnections {
    /// Records the connection unless one of the same kind is already live.
    fn claim(&self, connection_id: &ConnectionId, kind: ConnectionType) -> bool {
        let mut accepted = self.inner.lock();
        if accepted.values().any(|live| *live == kind) {
            return false;
        }
        accepted.insert(connection_id.clone(), kind);
        true
    }

    fn release(&self, connection_id: &ConnectionId) -> bool {
        self.inner.lock().remove(connection_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

pub struct AssistClient {
    manager: PeerManager,
    backend: BackendClient,
    peer: PeerInfo,
    accepted: AcceptedConnections,
}

#[async_trait]
impl Reconnect for AssistClient {
    type Error = anyhow::Error;

    fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    fn has_active_connections(&self) -> bool {
        !self.accepted.is_empty()
    }

    async fn connect(&self) -> Result<PeerId> {
        self.manager
            .connect(self.peer.peer_id.clone())
            .await
            .context("connecting to the relay")
    }

    async fn subscribe(&self, peer_id: &PeerId) -> Result<()> {
        self.backend
            .subscribe(peer_id, &self.peer.description)
            .await
            .context("subscribing to the backend")
    }
}

type Supervisor = ConnectionSupervisor<AssistClient>;

impl AssistClient {
    fn handle(&self, event: ClientEvent, supervisor: &Arc<Supervisor>, giving_up: &mpsc::UnboundedSender<()>) {
        match event {
            ClientEvent::SignallingOpened { peer_id } => {
                tracing::info!(peer = %peer_id, "connected to the relay");
            }
            ClientEvent::SignallingError { reason } => {
                tracing::warn!(%reason, "relay reported an error");
            }
            ClientEvent::SignallingClosed => {
                if self.accepted.is_empty() {
                    tracing::info!("relay connection closed, reconnecting");
                } else {
                    tracing::info!("relay connection closed, keeping active connections");
                }
                spawn_reconnect(supervisor, ReconnectTrigger::ConnectionLost, giving_up.clone());
            }
            ClientEvent::DataRequest(request) => {
                tracing::info!(peer = %request.peer_id(), label = ?request.label(), "data exchange request");
                if self.accepted.claim(request.connection_id(), ConnectionType::Data) {
                    tokio::spawn(follow_instructions(request.accept()));
                } else {
                    tracing::info!(peer = %request.peer_id(), "busy, rejecting data exchange");
                    request.reject();
                }
            }
            ClientEvent::CallRequest(request) => {
                tracing::info!(peer = %request.peer_id(), "call request");
                if self.accepted.claim(request.connection_id(), ConnectionType::Media) {
                    tokio::spawn(watch_tracks(request.accept()));
                } else {
                    tracing::info!(peer = %request.peer_id(), "busy, rejecting call");
                    request.reject();
                }
            }
            ClientEvent::ConnectionClosed {
                peer_id,
                connection_id,
                kind,
            } => {
                let known = connection_id
                    .as_ref()
                    .is_some_and(|id| self.accepted.release(id));
                tracing::info!(peer = %peer_id, connection_id = ?connection_id, %kind, "connection closed");
                if known && self.accepted.is_empty() {
                    tracing::info!("waiting for incoming requests");
                }
            }
            ClientEvent::PeerLeft { peer_id } => {
                tracing::debug!(peer = %peer_id, "peer left the relay");
            }
        }
    }
}

fn spawn_reconnect(supervisor: &Arc<Supervisor>, trigger: ReconnectTrigger, giving_up: mpsc::UnboundedSender<()>) {
    let supervisor = Arc::clone(supervisor);
    tokio::spawn(async move {
        match supervisor.reconnect(trigger).await {
            ReconnectOutcome::Exhausted { terminal: true, .. } => {
                let _ = giving_up.send(());
            }
            outcome => tracing::debug!(?outcome, "reconnection finished"),
        }
    });
}

async fn follow_instructions(mut connection: DataConnection) {
    while let Some(mut channel) = connection.next_exchange().await {
        tracing::info!(channel = channel.id(), label = channel.label(), "instruction channel open");
        tokio::spawn(async move {
            let mut messages = channel.receive();
            while let Some(text) = messages.next().await {
                match parse_instruction(&text) {
                    Ok(instruction) => present(&instruction),
                    Err(err) => tracing::warn!(error = %err, "unable to parse incoming message"),
                }
            }
            tracing::debug!("instruction channel closed");
        });
    }
}

async fn watch_tracks(mut connection: MediaConnection) {
    while let Some(track) = connection.next_video_track().await {
        tracing::info!(
            peer = %connection.peer_id(),
            track = %track.track_id,
            stream = %track.stream_id,
            "receiving remote video"
        );
    }
}

/// Connects, registers with the backend and serves requests until ctrl-c or
/// until the relay is given up on.
pub async fn run(config: AppConfig) -> Result<()> {
    let signalling = Arc::new(SignallingClient::new(config.relay.clone(), SignallingOptions::default()));
    let manager = PeerManager::start(
        signalling,
        ManagerOptions {
            ice_servers: config.ice_servers.clone(),
            ..ManagerOptions::default()
        },
    )
    .await
    .context("starting the connection manager")?;
    let mut events = manager.events()?;

    let client = Arc::new(AssistClient {
        manager,
        backend: BackendClient::new(&config.backend, config.credentials.clone()),
        peer: config.peer.clone(),
        accepted: AcceptedConnections::default(),
    });
    let supervisor = Arc::new(ConnectionSupervisor::new(Arc::clone(&client), ReconnectPolicy::default()));
    let (giving_up_tx, mut giving_up) = mpsc::unbounded_channel();

    tracing::info!(relay = %config.relay.host, port = config.relay.port, "starting assist client");
    spawn_reconnect(&supervisor, ReconnectTrigger::ForegroundResume, giving_up_tx.clone());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break Ok(());
            }
            Some(()) = giving_up.recv() => {
                break Err(anyhow::anyhow!("unable to reach the relay server"));
            }
            event = events.recv() => match event {
                Some(event) => client.handle(event, &supervisor, &giving_up_tx),
                None => break Ok(()),
            },
        }
    };

    let _ = client.manager.disconnect();
    client.manager.shutdown().await;
    result
}

/// Prints the peers the relay currently knows about.
pub async fn list_peers(config: AppConfig) -> Result<()> {
    let signalling = SignallingClient::new(config.relay, SignallingOptions::default());
    let peer_id = signalling
        .connect(None)
        .await
        .context("connecting to the relay")?;
    let peers = signalling.active_peers().await;
    let _ = signalling.disconnect();
    let peers = peers.context("listing relay peers")?;

    if peers.is_empty() {
        println!("no other peers connected (this client is {peer_id})");
    }
    for peer in peers {
        println!("{peer}");
    }
    Ok(())
}
