//! Client event types
//!
//! Defines every event the client publishes on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rooms::RoomSnapshot;

/// Severity of a room message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Ok,
    Warn,
}

/// Where a membership update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// `/status` poll
    Poll,
    /// `/rooms/stream` server-sent event
    Push,
    /// Response to our own join/leave/kick request
    Request,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::Poll => write!(f, "poll"),
            UpdateSource::Push => write!(f, "push"),
            UpdateSource::Request => write!(f, "request"),
        }
    }
}

/// Client event enumeration
///
/// Serialized as `{"event": "...", "data": {...}}`, the same envelope the
/// server side of the project uses for its own notifications.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Message meant for the person using the client
    #[serde(rename = "room.message")]
    RoomMessage {
        severity: Severity,
        text: String,
    },

    /// Membership snapshot changed
    #[serde(rename = "room.updated")]
    RoomsUpdated {
        source: UpdateSource,
        rooms: RoomSnapshot,
    },

    /// The server-confirmed room of this client changed
    #[serde(rename = "room.current_changed")]
    CurrentRoomChanged {
        /// Previous room
        from: String,
        /// New room
        to: String,
    },

    /// Control lock owner changed
    #[serde(rename = "control.changed")]
    ControlChanged {
        owner_name: Option<String>,
        /// Whether this client holds the lock
        mine: bool,
    },

    /// Media transport state changed
    #[serde(rename = "media.state_changed")]
    MediaStateChanged {
        /// "connecting", "connected", "disconnected", "failed", "closed"
        state: String,
    },

    /// A media reconnect attempt was scheduled
    #[serde(rename = "media.reconnect_scheduled")]
    ReconnectScheduled {
        attempt: u32,
        delay_secs: u64,
    },

    /// The server stopped receiving our audio and we hopped through the lobby
    #[serde(rename = "media.intervention")]
    Intervention {
        room: String,
        at: DateTime<Utc>,
    },

    /// Background task error worth surfacing
    #[serde(rename = "system.error")]
    SystemError {
        /// Module that raised the error
        module: String,
        message: String,
    },
}

impl ClientEvent {
    /// Shorthand for [`ClientEvent::RoomMessage`]
    pub fn message(severity: Severity, text: impl Into<String>) -> Self {
        Self::RoomMessage {
            severity,
            text: text.into(),
        }
    }

    /// Event name used in the serialized envelope
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RoomMessage { .. } => "room.message",
            Self::RoomsUpdated { .. } => "room.updated",
            Self::CurrentRoomChanged { .. } => "room.current_changed",
            Self::ControlChanged { .. } => "control.changed",
            Self::MediaStateChanged { .. } => "media.state_changed",
            Self::ReconnectScheduled { .. } => "media.reconnect_scheduled",
            Self::Intervention { .. } => "media.intervention",
            Self::SystemError { .. } => "system.error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let event = ClientEvent::message(Severity::Warn, "Mic 3 is full (6/6).");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.event_name());
        assert_eq!(json["data"]["severity"], "warn");
        assert_eq!(json["data"]["text"], "Mic 3 is full (6/6).");
    }
}
