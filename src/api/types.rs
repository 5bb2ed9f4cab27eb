//! Wire types of the SmartMic HTTP/JSON API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::rooms::{CapacityMap, RoomSnapshot};

/// Fields every mutating endpoint answers with
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl Ack {
    /// Turn `success: false` into [`AppError::Rejected`]
    pub fn into_result(self, fallback: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        Err(AppError::rejected(
            self.error_code.as_deref(),
            self.error.unwrap_or_else(|| fallback.to_string()),
        ))
    }
}

/// `POST /rooms/join` body
#[derive(Debug, Clone, Serialize)]
pub struct JoinRequest<'a> {
    pub room: &'a str,
    pub name: &'a str,
    pub delay: i64,
}

/// `capacity` is a map on success but the single room limit on `room_full`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CapacityField {
    Limit(u32),
    Map(CapacityMap),
}

/// `POST /rooms/join` response
#[derive(Debug, Clone, Deserialize)]
pub struct JoinResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rooms: Option<RoomSnapshot>,
    #[serde(default)]
    pub capacity: Option<CapacityField>,
    #[serde(default)]
    pub capacity_map: Option<CapacityMap>,
    #[serde(default)]
    pub members: Option<u32>,
}

/// Outcome of a join request as far as the server is concerned
#[derive(Debug, Clone, PartialEq)]
pub enum JoinReply {
    Joined {
        /// Room the server put us in (may differ from the requested one)
        room: String,
        /// Name the server recorded
        name: Option<String>,
        rooms: Option<RoomSnapshot>,
        capacity: Option<CapacityMap>,
    },
    Full {
        room: String,
        members: u32,
        capacity: u32,
    },
    Rejected {
        code: Option<String>,
        message: String,
    },
}

impl JoinResponse {
    /// Interpret the response for a join to `requested`
    pub fn into_reply(self, requested: &str) -> JoinReply {
        if self.ack.success {
            let capacity = match self.capacity {
                Some(CapacityField::Map(map)) => Some(map),
                _ => None,
            };
            return JoinReply::Joined {
                room: self.room.unwrap_or_else(|| requested.to_string()),
                name: self.name,
                rooms: self.rooms,
                capacity,
            };
        }

        if self.ack.error_code.as_deref() == Some("room_full") {
            let room = self.room.unwrap_or_else(|| requested.to_string());
            let capacity = match self.capacity {
                Some(CapacityField::Limit(limit)) => limit,
                _ => self
                    .capacity_map
                    .as_ref()
                    .map(|m| m.limit(&room))
                    .unwrap_or(crate::rooms::DEFAULT_CAPACITY),
            };
            let members = self
                .members
                .or_else(|| self.rooms.as_ref().map(|r| r.count(&room) as u32))
                .unwrap_or(capacity);
            return JoinReply::Full {
                room,
                members,
                capacity,
            };
        }

        JoinReply::Rejected {
            code: self.ack.error_code,
            message: self
                .ack
                .error
                .unwrap_or_else(|| "Server join failed".to_string()),
        }
    }
}

/// Membership and capacity, from `/rooms`, `/rooms/leave` and the push channel
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomsUpdate {
    #[serde(default)]
    pub rooms: Option<RoomSnapshot>,
    #[serde(default)]
    pub capacity: Option<CapacityMap>,
}

/// `GET /rooms` / `POST /rooms/leave` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RoomsResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(flatten)]
    pub update: RoomsUpdate,
}

/// `POST /rooms/capacity` body
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CapacityRequest<'a> {
    pub capacity: &'a CapacityMap,
}

/// `POST /rooms/capacity` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CapacityResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub capacity: Option<CapacityMap>,
}

/// Control lock block of `/status` and `/control/status`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControlStatus {
    #[serde(default)]
    pub owner: Option<i64>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub password_required: bool,
    #[serde(default)]
    pub password_ok: bool,
}

/// `POST /control/acquire` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AcquireResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub owner: Option<i64>,
    #[serde(default)]
    pub owner_name: Option<String>,
}

/// What the server knows about this client
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct YouInfo {
    #[serde(default)]
    pub session_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    /// Unix time (seconds) the server last received our audio
    #[serde(default)]
    pub audio_last_seen: Option<f64>,
}

/// `GET /status` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rooms: Option<RoomSnapshot>,
    #[serde(default)]
    pub capacity: Option<CapacityMap>,
    #[serde(default)]
    pub control: Option<ControlStatus>,
    #[serde(default)]
    pub you: Option<YouInfo>,
    #[serde(default)]
    pub latency_by_name: HashMap<String, f64>,
}

/// `POST /player/delay` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DelayResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub delay: Option<i64>,
}

/// `POST /api` (`start_webrtc`) response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StartMediaResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub player_id: Option<i64>,
}

/// `POST /rooms/kick` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KickResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub rooms: Option<RoomSnapshot>,
}

/// `POST /client/metrics` body
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    pub latency_ms: Option<u64>,
    pub audio_level: Option<f32>,
}

/// Song id; the catalogue hands out numbers or strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SongId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for SongId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{}", id),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl std::str::FromStr for SongId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(s.parse::<i64>()
            .map(Self::Number)
            .unwrap_or_else(|_| Self::Text(s.to_string())))
    }
}

/// One `/songs/search` hit
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SongItem {
    /// Missing ids cannot be previewed or queued
    #[serde(default)]
    pub id: Option<SongId>,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub mp3: Option<String>,
    /// Already on the user playlist
    #[serde(default)]
    pub upl: bool,
}

/// `GET /songs/search` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SongSearchResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub items: Vec<SongItem>,
}

/// User playlist edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplAction {
    Add,
    Remove,
}

/// `POST /songs/add_to_upl` body
#[derive(Debug, Clone, Serialize)]
pub(crate) struct UplRequest<'a> {
    pub id: &'a SongId,
    pub action: UplAction,
}

/// Result of a user playlist edit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UplChange {
    /// Whether the song is on the playlist now
    #[serde(default)]
    pub upl: bool,
    /// Playlist line the server wrote or removed
    #[serde(default)]
    pub line: Option<String>,
}

/// `POST /songs/add_to_upl` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UplResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(flatten)]
    pub change: UplChange,
}

/// Playlist mode state from `/playlist/status` and `/playlist/toggle`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlaylistStatus {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub current_song: Option<String>,
    #[serde(default)]
    pub next_song: Option<String>,
    /// Configured pause between songs
    #[serde(default)]
    pub countdown_seconds: Option<f64>,
    #[serde(default)]
    pub countdown_active: bool,
    #[serde(default)]
    pub countdown_remaining: Option<f64>,
    /// Random songs the server queued on its own
    #[serde(default)]
    pub auto_added: Option<u32>,
    /// Room and keyboard controls are locked while it runs
    #[serde(default)]
    pub lock_controls: bool,
}

impl PlaylistStatus {
    /// One-line summary, "Idle" when the server says nothing
    pub fn headline(&self) -> &str {
        self.status_text
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or("Idle")
    }

    /// Countdown line: remaining seconds while active, else the headline
    pub fn countdown_text(&self) -> String {
        match self.countdown_remaining {
            Some(remaining) if self.countdown_active && remaining.is_finite() => {
                format!("{} s remaining", remaining.max(0.0))
            }
            _ => self.headline().to_string(),
        }
    }
}

/// `GET /playlist/status` response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlaylistStatusResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(flatten)]
    pub status: PlaylistStatus,
}

/// `POST /playlist/toggle` body
#[derive(Debug, Clone, Serialize)]
pub(crate) struct PlaylistToggleRequest {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<u32>,
}

/// `POST /playlist/toggle` response; the state is nested or inline
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlaylistToggleResponse {
    #[serde(flatten)]
    pub ack: Ack,
    #[serde(default)]
    pub state: Option<PlaylistStatus>,
    #[serde(flatten)]
    pub inline: PlaylistStatus,
}

impl PlaylistToggleResponse {
    pub fn into_status(self) -> PlaylistStatus {
        self.state.unwrap_or(self.inline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_success_reply() {
        let response: JoinResponse = serde_json::from_str(
            r#"{"success": true, "room": "mic1", "name": "Alice",
                "rooms": {"lobby": [], "mic1": ["Alice"]},
                "capacity": {"mic1": 6}}"#,
        )
        .unwrap();
        match response.into_reply("mic3") {
            JoinReply::Joined { room, name, rooms, capacity } => {
                assert_eq!(room, "mic1");
                assert_eq!(name.as_deref(), Some("Alice"));
                assert!(rooms.unwrap().contains("mic1", "Alice"));
                assert_eq!(capacity.unwrap().limit("mic1"), 6);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_join_room_full_reply() {
        let response: JoinResponse = serde_json::from_str(
            r#"{"success": false, "error": "mic3 is full", "error_code": "room_full",
                "room": "mic3", "members": 6, "capacity": 6,
                "capacity_map": {"mic3": 6}}"#,
        )
        .unwrap();
        assert_eq!(
            response.into_reply("mic3"),
            JoinReply::Full {
                room: "mic3".to_string(),
                members: 6,
                capacity: 6
            }
        );
    }

    #[test]
    fn test_join_generic_rejection() {
        let response: JoinResponse =
            serde_json::from_str(r#"{"success": false, "error": "Unknown room"}"#).unwrap();
        assert_eq!(
            response.into_reply("stage"),
            JoinReply::Rejected {
                code: None,
                message: "Unknown room".to_string()
            }
        );
    }

    #[test]
    fn test_status_report_parses_server_payload() {
        let report: StatusReport = serde_json::from_str(
            r#"{"success": true,
                "rooms": {"lobby": ["Bob"], "mic2": ["Alice"]},
                "capacity": {"mic2": 4},
                "control": {"owner": 4242, "owner_name": "Bob", "timestamp": 1700000000.5,
                            "password_required": true, "password_ok": false},
                "you": {"session_id": 1234567, "name": "Alice", "room": "mic2",
                        "audio_last_seen": 1700000001.25}}"#,
        )
        .unwrap();
        assert!(report.success);
        assert_eq!(report.control.as_ref().unwrap().owner, Some(4242));
        assert!(report.control.unwrap().password_required);
        let you = report.you.unwrap();
        assert_eq!(you.session_id, Some(1234567));
        assert_eq!(you.room.as_deref(), Some("mic2"));
        assert!(report.latency_by_name.is_empty());
    }

    #[test]
    fn test_song_search_items() {
        let response: SongSearchResponse = serde_json::from_str(
            r#"{"success": true, "items": [
                {"id": 17, "display": "ABBA - Waterloo", "mp3": "abba/waterloo.mp3", "upl": true},
                {"id": "x9", "display": "Queen - Bohemian Rhapsody"},
                {"display": "No id"}]}"#,
        )
        .unwrap();
        assert!(response.ack.success);
        let items = response.items;
        assert_eq!(items[0].id, Some(SongId::Number(17)));
        assert!(items[0].upl);
        assert_eq!(items[1].id, Some(SongId::Text("x9".to_string())));
        assert!(!items[1].upl);
        assert_eq!(items[2].id, None);
        assert_eq!("17".parse::<SongId>().unwrap(), SongId::Number(17));
        assert_eq!(SongId::Text("x9".to_string()).to_string(), "x9");
    }

    #[test]
    fn test_playlist_toggle_state_nested_or_inline() {
        let nested: PlaylistToggleResponse = serde_json::from_str(
            r#"{"success": true, "state": {"enabled": true, "countdown_seconds": 20,
                "countdown_active": true, "countdown_remaining": 7}}"#,
        )
        .unwrap();
        let status = nested.into_status();
        assert!(status.enabled);
        assert_eq!(status.countdown_text(), "7 s remaining");

        let inline: PlaylistToggleResponse = serde_json::from_str(
            r#"{"success": true, "enabled": false, "status_text": "Stopped"}"#,
        )
        .unwrap();
        let status = inline.into_status();
        assert!(!status.enabled);
        assert_eq!(status.countdown_text(), "Stopped");
        assert_eq!(PlaylistStatus::default().headline(), "Idle");
    }

    #[test]
    fn test_ack_into_result() {
        let ack: Ack = serde_json::from_str(
            r#"{"success": false, "error": "Control lock required to change capacity",
                "error_code": "control_required"}"#,
        )
        .unwrap();
        let err = ack.into_result("Capacity update failed").unwrap_err();
        assert!(matches!(err, AppError::Rejected { ref code, .. } if code == "control_required"));
    }
}
