//! Event system for client state notifications
//!
//! The client never renders anything itself. Room messages, membership
//! changes, control lock changes and media state are published on an
//! [`EventBus`] for whatever front end embeds the client (the CLI just logs
//! them).

pub mod types;

pub use types::{ClientEvent, Severity, UpdateSource};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting client events
///
/// # Example
///
/// ```no_run
/// use smartmic::events::{ClientEvent, EventBus, Severity};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(ClientEvent::message(Severity::Info, "Tap a mic to join a channel."));
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published while nobody listens are dropped.
    pub fn publish(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a room message
    pub fn message(&self, severity: Severity, text: impl Into<String>) {
        self.publish(ClientEvent::message(severity, text));
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses
    /// the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
