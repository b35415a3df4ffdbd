use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ids::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Grace period before the first attempt after a lost session.
    pub initial_delay: Duration,
    pub max_attempts: u32,
    /// Attempt `n` that fails is followed by a wait of `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5_000),
            max_attempts: 15,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    /// The relay session ended on its own.
    ConnectionLost,
    /// The application came back to the foreground and knows it is offline;
    /// skips the grace period.
    ForegroundResume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Another reconnection was already running.
    Skipped,
    AlreadyConnected { attempts: u32 },
    Reconnected { peer_id: PeerId, attempts: u32 },
    /// Every attempt failed. `terminal` is set when no connection was active,
    /// which is when the application should give up on the session.
    Exhausted { attempts: u32, terminal: bool },
}

/// What the supervisor drives.
#[async_trait]
pub trait Reconnect: Send + Sync {
    type Error: Display + Send;

    fn is_connected(&self) -> bool;

    fn has_active_connections(&self) -> bool;

    async fn connect(&self) -> Result<PeerId, Self::Error>;

    /// Re-announces `peer_id` to the application backend.
    async fn subscribe(&self, peer_id: &PeerId) -> Result<(), Self::Error>;
}

/// Re-establishes the relay session without disturbing live connections.
pub struct ConnectionSupervisor<R: ?Sized> {
    target: Arc<R>,
    policy: ReconnectPolicy,
    reconnecting: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<R: Reconnect + ?Sized> ConnectionSupervisor<R> {
    pub fn new(target: Arc<R>, policy: ReconnectPolicy) -> Self {
        Self {
            target,
            policy,
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub async fn reconnect(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(target = "supervisor", ?trigger, "reconnection already in progress");
            return ReconnectOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.reconnecting);

        if trigger == ReconnectTrigger::ConnectionLost && !self.policy.initial_delay.is_zero() {
            tokio::time::sleep(self.policy.initial_delay).await;
        }

        for attempt in 1..=self.policy.max_attempts {
            if self.target.is_connected() {
                tracing::debug!(target = "supervisor", attempt, "already connected");
                return ReconnectOutcome::AlreadyConnected {
                    attempts: attempt - 1,
                };
            }
            tracing::info!(target = "supervisor", attempt, max = self.policy.max_attempts, "reconnecting");
            match self.attempt().await {
                Ok(peer_id) => {
                    tracing::info!(target = "supervisor", attempt, peer = %peer_id, "reconnected");
                    return ReconnectOutcome::Reconnected {
                        peer_id,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        target = "supervisor",
                        attempt,
                        error = %err,
                        retry_in_ms = wait.as_millis() as u64,
                        "reconnection attempt failed"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let terminal = !self.target.has_active_connections();
        if terminal {
            tracing::error!(
                target = "supervisor",
                attempts = self.policy.max_attempts,
                "unable to reach the relay, giving up"
            );
        } else {
            tracing::warn!(
                target = "supervisor",
                attempts = self.policy.max_attempts,
                "relay unreachable; keeping active connections"
            );
        }
        ReconnectOutcome::Exhausted {
            attempts: self.policy.max_attempts,
            terminal,
        }
    }

    async fn attempt(&self) -> Result<PeerId, R::Error> {
        let peer_id = self.target.connect().await?;
        self.target.subscribe(&peer_id).await?;
        Ok(peer_id)
    }
}
