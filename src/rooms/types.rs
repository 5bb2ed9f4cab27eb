//! Room data types
//!
//! Rooms are identified by plain strings. The server knows a `lobby` with no
//! capacity limit and six mic rooms (`mic1`..`mic6`) whose capacity is a
//! small integer between [`MIN_CAPACITY`] and [`MAX_CAPACITY`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Room every client falls back to
pub const LOBBY: &str = "lobby";

/// Mic rooms in display order
pub const MIC_ROOMS: [&str; 6] = ["mic1", "mic2", "mic3", "mic4", "mic5", "mic6"];

/// Lowest accepted capacity for a mic room
pub const MIN_CAPACITY: u32 = 1;

/// Highest accepted capacity, also the default
pub const MAX_CAPACITY: u32 = 6;

/// Default capacity applied when the server reports nothing usable
pub const DEFAULT_CAPACITY: u32 = MAX_CAPACITY;

/// Maximum display name length in characters
pub const MAX_NAME_LENGTH: usize = 16;

/// Membership of every room as last reported by the server
///
/// Member order within a room carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomSnapshot {
    rooms: HashMap<String, Vec<String>>,
}

impl RoomSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a room (empty if the room is unknown)
    pub fn members(&self, room: &str) -> &[String] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of members in a room
    pub fn count(&self, room: &str) -> usize {
        self.members(room).len()
    }

    /// Whether `name` is listed in `room`
    pub fn contains(&self, room: &str, name: &str) -> bool {
        self.members(room).iter().any(|m| m == name)
    }

    /// Find the room that lists `name`
    ///
    /// If the server lists the name more than once (it should not), the
    /// lexicographically first room wins so the result is deterministic.
    pub fn locate(&self, name: &str) -> Option<&str> {
        let mut found: Option<&str> = None;
        for (room, members) in &self.rooms {
            if members.iter().any(|m| m == name) {
                match found {
                    Some(prev) if prev <= room.as_str() => {}
                    _ => found = Some(room.as_str()),
                }
            }
        }
        found
    }

    /// Whether the room id exists in this snapshot
    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// All room ids, sorted
    pub fn room_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.rooms.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }

    /// Iterate over `(room, members)` in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.rooms.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl From<HashMap<String, Vec<String>>> for RoomSnapshot {
    fn from(rooms: HashMap<String, Vec<String>>) -> Self {
        Self { rooms }
    }
}

impl<const N: usize> From<[(&str, &[&str]); N]> for RoomSnapshot {
    fn from(entries: [(&str, &[&str]); N]) -> Self {
        let rooms = entries
            .into_iter()
            .map(|(room, members)| {
                (
                    room.to_string(),
                    members.iter().map(|m| m.to_string()).collect(),
                )
            })
            .collect();
        Self { rooms }
    }
}

/// Capacity limit per mic room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapacityMap {
    limits: HashMap<String, u32>,
}

impl CapacityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of a room, or the default if the server never reported one
    pub fn limit(&self, room: &str) -> u32 {
        self.limits.get(room).copied().unwrap_or(DEFAULT_CAPACITY)
    }

    /// Set a room limit, clamping it into range
    pub fn set(&mut self, room: impl Into<String>, limit: u32) {
        self.limits.insert(room.into(), clamp_capacity(limit));
    }

    /// Merge limits reported by the server, returns whether anything changed
    pub fn merge(&mut self, other: &CapacityMap) -> bool {
        let mut changed = false;
        for (room, limit) in &other.limits {
            let limit = clamp_capacity(*limit);
            if self.limits.get(room) != Some(&limit) {
                self.limits.insert(room.clone(), limit);
                changed = true;
            }
        }
        changed
    }

    /// The single limit shared by all mic rooms (first mic room that has one)
    pub fn unified(&self) -> u32 {
        MIC_ROOMS
            .iter()
            .find_map(|room| self.limits.get(*room).copied())
            .map(clamp_capacity)
            .unwrap_or(DEFAULT_CAPACITY)
    }

    /// Build a map that applies `limit` to every mic room
    pub fn uniform(limit: u32) -> Self {
        let mut map = Self::new();
        for room in MIC_ROOMS {
            map.set(room, limit);
        }
        map
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.limits.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Clamp a capacity into `MIN_CAPACITY..=MAX_CAPACITY`
pub fn clamp_capacity(limit: u32) -> u32 {
    limit.clamp(MIN_CAPACITY, MAX_CAPACITY)
}

/// Parse a capacity from loose user input, falling back to the default
pub fn parse_capacity(raw: &str) -> u32 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => clamp_capacity(v.round().max(0.0) as u32),
        _ => DEFAULT_CAPACITY,
    }
}

/// Human readable room name ("Lobby", "Mic 3", or the raw id)
pub fn pretty_room_name(room: &str) -> String {
    if room.is_empty() {
        return "Room".to_string();
    }
    if room == LOBBY {
        return "Lobby".to_string();
    }
    match MIC_ROOMS.iter().position(|r| *r == room) {
        Some(idx) => format!("Mic {}", idx + 1),
        None => room.to_string(),
    }
}

/// "1 singer" / "4 singers"
pub fn format_capacity_label(limit: u32) -> String {
    let limit = clamp_capacity(limit);
    if limit == 1 {
        "1 singer".to_string()
    } else {
        format!("{} singers", limit)
    }
}

/// Trim and truncate a display name, `None` if nothing is left
pub fn normalize_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_NAME_LENGTH).collect())
}

/// Mic room id for a 1-based mic number
pub fn mic_room(number: usize) -> Option<&'static str> {
    number.checked_sub(1).and_then(|idx| MIC_ROOMS.get(idx).copied())
}
