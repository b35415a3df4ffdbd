use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Per-channel outgoing queue depth before `send` starts refusing.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One logical text channel inside a data connection.
#[derive(Debug)]
pub struct ExchangeChannel {
    id: u16,
    label: String,
    sender: ExchangeSender,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl ExchangeChannel {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue `text` without waiting. Returns false when the queue is full or
    /// the channel has closed.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.sender.send(text)
    }

    pub fn sender(&self) -> ExchangeSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Inbound messages in arrival order; ends when the channel closes.
    pub fn receive(&mut self) -> impl Stream<Item = String> + '_ {
        stream::poll_fn(move |cx| self.incoming.poll_recv(cx))
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeSender {
    id: u16,
    outgoing: mpsc::Sender<String>,
}

impl ExchangeSender {
    pub fn send(&self, text: impl Into<String>) -> bool {
        match self.outgoing.try_send(text.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(target = "rtc", channel = self.id, "exchange channel backpressure");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
struct MuxState {
    taps: HashMap<u16, mpsc::UnboundedSender<String>>,
    /// Text that arrived before its channel was opened, per channel id.
    early: HashMap<u16, Vec<String>>,
    /// Dropped on close, which ends the application's announcement stream.
    announcements: Option<mpsc::UnboundedSender<ExchangeChannel>>,
}

/// Fans the channels of one data connection out to the application.
///
/// Every channel that opens is announced exactly once on the announcement
/// queue returned by [`DataChannelMultiplexer::new`].
#[derive(Debug, Clone)]
pub struct DataChannelMultiplexer {
    state: Arc<Mutex<MuxState>>,
    capacity: usize,
}

impl DataChannelMultiplexer {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<ExchangeChannel>) {
        let (announcements, rx) = mpsc::unbounded_channel();
        let mux = Self {
            state: Arc::new(Mutex::new(MuxState {
                taps: HashMap::new(),
                early: HashMap::new(),
                announcements: Some(announcements),
            })),
            capacity: capacity.max(1),
        };
        (mux, rx)
    }

    /// Registers channel `id` and announces it, together with any text that
    /// was delivered for it beforehand. Returns the outgoing queue the
    /// transport side must drain, or `None` when the channel was already
    /// announced or the multiplexer is closed.
    pub fn open(&self, id: u16, label: &str) -> Option<mpsc::Receiver<String>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.taps.contains_key(&id) {
            return None;
        }
        let announcements = state.announcements.as_ref()?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.capacity);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        for text in state.early.remove(&id).unwrap_or_default() {
            let _ = incoming_tx.send(text);
        }
        let channel = ExchangeChannel {
            id,
            label: label.to_owned(),
            sender: ExchangeSender {
                id,
                outgoing: outgoing_tx,
            },
            incoming: incoming_rx,
        };
        if announcements.send(channel).is_err() {
            tracing::debug!(target = "rtc", channel = id, "nobody is listening for exchange channels");
            return None;
        }
        state.taps.insert(id, incoming_tx);
        Some(outgoing_rx)
    }

    /// Hands an inbound text message to channel `id`. Text for a channel that
    /// has not been opened yet is held until it is, up to the channel
    /// capacity.
    pub fn deliver(&self, id: u16, text: String) -> bool {
        let mut state = self.state.lock();
        if let Some(tap) = state.taps.get(&id) {
            return tap.send(text).is_ok();
        }
        if state.announcements.is_none() {
            return false;
        }
        let held = state.early.entry(id).or_default();
        if held.len() >= self.capacity {
            return false;
        }
        held.push(text);
        true
    }

    pub fn closed(&self, id: u16) {
        let mut state = self.state.lock();
        state.taps.remove(&id);
        state.early.remove(&id);
    }

    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.announcements = None;
        state.taps.clear();
        state.early.clear();
    }
}
