//! Media reconnect supervisor
//!
//! When the media transport fails the supervisor waits, silently rejoins
//! our current room so the server-side session exists again, and rebuilds
//! the media session. Delays grow exponentially up to a cap and the loop
//! never gives up.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::Result;
use crate::events::{ClientEvent, EventBus, Severity};
use crate::join::{JoinFailure, JoinOptions, JoinRequester};
use crate::session::SessionHandle;

/// Something that can (re)establish the media transport
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Tear down any previous transport and build a new one
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport
    async fn close(&self);
}

/// Why the transport was declared broken
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaFailure {
    /// Peer/ICE state went to disconnected or failed
    Transport(String),
    /// The initial connect never succeeded
    Connect(String),
}

impl std::fmt::Display for MediaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(state) => write!(f, "transport {}", state),
            Self::Connect(err) => write!(f, "connect failed: {}", err),
        }
    }
}

/// Sending half handed to the media session
pub type FailureSender = mpsc::UnboundedSender<MediaFailure>;

/// Bounded exponential backoff
///
/// `attempt = min(max_attempt, attempt + 1)`,
/// `delay = min(max_delay, 2^attempt seconds)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempt: u32,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempt: u32, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempt: max_attempt.max(1),
            max_delay,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.max_attempt, Duration::from_secs(config.max_delay_secs))
    }

    /// Advance and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = (self.attempt + 1).min(self.max_attempt);
        let secs = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

pub struct ReconnectSupervisor {
    media: Arc<dyn MediaSession>,
    joins: Arc<JoinRequester>,
    session: SessionHandle,
    events: Arc<EventBus>,
    backoff: Backoff,
    failures: mpsc::UnboundedReceiver<MediaFailure>,
}

impl ReconnectSupervisor {
    /// Returns the supervisor and the sender the media session reports on
    pub fn new(
        media: Arc<dyn MediaSession>,
        joins: Arc<JoinRequester>,
        session: SessionHandle,
        events: Arc<EventBus>,
        backoff: Backoff,
    ) -> (Self, FailureSender) {
        let (tx, failures) = mpsc::unbounded_channel();
        (
            Self {
                media,
                joins,
                session,
                events,
                backoff,
                failures,
            },
            tx,
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let failure = tokio::select! {
                _ = cancel.cancelled() => break,
                failure = self.failures.recv() => match failure {
                    Some(failure) => failure,
                    None => break,
                },
            };
            warn!("Media {}", failure);
            self.events.message(Severity::Warn, "Connection unstable, reconnecting...");

            if !self.recover(&cancel).await {
                break;
            }
        }
        self.media.close().await;
        debug!("Reconnect supervisor stopped");
    }

    /// Retry until the media session is back; false if cancelled
    async fn recover(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            info!(
                "Scheduling reconnect attempt in {}s (attempt {})",
                delay.as_secs(),
                attempt
            );
            self.events.publish(ClientEvent::ReconnectScheduled {
                attempt,
                delay_secs: delay.as_secs(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            // Signals raised while a retry was scheduled describe the same outage
            while self.failures.try_recv().is_ok() {}

            info!("Attempting reconnect (attempt {})", attempt);
            self.rejoin_current_room().await;

            match self.media.connect().await {
                Ok(()) => {
                    self.backoff.reset();
                    info!("Reconnect successful");
                    return true;
                }
                Err(e) => warn!("Reconnect failed: {}", e),
            }
        }
    }

    async fn rejoin_current_room(&self) {
        let room = self.session.read(|s| s.current_room().to_string());
        match self.joins.join(&room, JoinOptions::silent()).await {
            Ok(_) | Err(JoinFailure::NoName) => {}
            Err(e) => debug!("Rejoin of {} before reconnect failed: {}", room, e),
        }
    }
}
