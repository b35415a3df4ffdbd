//! PeerJS-style relay signalling and WebRTC connection management.
//!
//! [`SignallingClient`] speaks the relay protocol; [`PeerManager`] builds on
//! it to create, negotiate and dispose of data and media connections;
//! [`ConnectionSupervisor`] restores a lost relay session.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod manager;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod registry;
mod rtc;
pub mod supervisor;
pub mod transport;

pub use channel::{ExchangeChannel, ExchangeSender};
pub use client::{IncomingOffer, SignallingClient, SignallingEvent};
pub use config::{AuthParams, RelayConfig, SignallingOptions};
pub use error::{SignalError, SignalResult};
pub use ids::{ConnectionId, ConnectionType, PeerId};
pub use manager::{
    ClientEvent, DataConnection, IncomingRequest, LocalTrack, ManagerOptions, MediaConnection,
    PeerManager,
};
pub use media::{RemoteTrackInfo, TrackKind};
pub use protocol::{IceCandidate, MessageType, SessionDescription, SignallingMessage};
pub use supervisor::{
    ConnectionSupervisor, Reconnect, ReconnectOutcome, ReconnectPolicy, ReconnectTrigger,
};
