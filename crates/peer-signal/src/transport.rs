use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{SignalError, SignalResult};
use crate::protocol::SignallingMessage;

/// One inbound frame from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// The relay only speaks text; binary frames are reported by size and ignored.
    Binary(usize),
}

/// Persistent bidirectional text channel to the relay.
pub struct SignallingTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignallingTransport {
    pub async fn connect(url: &Url) -> SignalResult<Self> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalError::Setup(format!("relay websocket connect failed: {err}")))?;
        tracing::debug!(target = "signalling", host = ?url.host_str(), "relay websocket open");
        Ok(Self { stream })
    }

    pub async fn send_text(&mut self, text: String) -> SignalResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next data frame, `None` once the relay has closed the socket.
    ///
    /// Cancel safe: control frames are consumed internally and nothing is
    /// buffered between polls.
    pub async fn recv(&mut self) -> Option<SignalResult<InboundFrame>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(InboundFrame::Binary(bytes.len()))),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(target = "signalling", ?frame, "relay sent close");
                    return None;
                }
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
        None
    }

    pub async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::trace!(target = "signalling", error = %err, "relay websocket close");
        }
    }
}

/// Queues a heartbeat every `period` until the outgoing queue is gone.
pub fn spawn_heartbeat(
    outgoing: mpsc::UnboundedSender<SignallingMessage>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if outgoing.send(SignallingMessage::heartbeat()).is_err() {
                break;
            }
            tracing::trace!(target = "signalling", "heartbeat queued");
        }
    })
}
