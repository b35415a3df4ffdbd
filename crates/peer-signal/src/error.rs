use std::time::Duration;

use thiserror::Error;

use crate::ids::{ConnectionId, PeerId};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no answer from {peer} within {timeout:?}")]
    Timeout { peer: PeerId, timeout: Duration },
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("offer rejected: {0}")]
    Rejected(String),
    #[error("relay did not open a session within {0:?}")]
    ConnectTimeout(Duration),
    #[error("signalling transport closed")]
    TransportClosed,
    #[error("an offer to {0} is still awaiting its answer")]
    OfferPending(PeerId),
    #[error("not connected to the relay")]
    NotConnected,
    #[error("already connected to the relay")]
    AlreadyConnected,
    #[error("relay refused the session: {0}")]
    Refused(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type SignalResult<T> = Result<T, SignalError>;

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Protocol(err.to_string())
    }
}

impl From<webrtc::Error> for SignalError {
    fn from(err: webrtc::Error) -> Self {
        SignalError::Negotiation(err.to_string())
    }
}

impl From<url::ParseError> for SignalError {
    fn from(err: url::ParseError) -> Self {
        SignalError::Setup(format!("invalid relay url: {err}"))
    }
}
