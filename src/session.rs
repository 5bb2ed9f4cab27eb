//! Client session state
//!
//! [`ClientSession`] is the local cache of everything the client believes
//! about itself: display name, the room it wants to be in, the room the
//! server last confirmed, and the suppression deadline that keeps the
//! reconciler from contesting a join that is still in flight.
//!
//! The server is the sole source of truth for membership. Nothing here
//! moves the client between rooms on its own; rooms only change when a
//! join is confirmed or the server reports the client elsewhere.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::control::ControlLock;
use crate::error::{AppError, Result};
use crate::rooms::{normalize_display_name, CapacityMap, RoomSnapshot, LOBBY};

/// Upper bound of any suppression window
pub const MAX_SUPPRESSION: Duration = Duration::from_secs(10);

/// Part of the session that survives restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub name: Option<String>,
    pub current_room: Option<String>,
    pub desired_room: Option<String>,
}

/// Local state cache of one client
#[derive(Debug, Clone)]
pub struct ClientSession {
    name: Option<String>,
    desired_room: Option<String>,
    current_room: String,
    suppressed_until: Option<Instant>,
    rooms: RoomSnapshot,
    capacity: CapacityMap,
    /// Session id the server assigned to our cookie
    session_id: Option<i64>,
    /// Room the server last reported for us in `/status`
    last_server_room: Option<String>,
    /// Incremented for every join request, used to drop superseded responses
    join_generation: u64,
    control: ControlLock,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self {
            name: None,
            desired_room: None,
            current_room: LOBBY.to_string(),
            suppressed_until: None,
            rooms: RoomSnapshot::default(),
            capacity: CapacityMap::default(),
            session_id: None,
            last_server_room: None,
            join_generation: 0,
            control: ControlLock::default(),
        }
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted state
    pub fn from_persisted(persisted: &PersistedSession) -> Self {
        let current_room = persisted
            .current_room
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| LOBBY.to_string());
        Self {
            name: persisted.name.as_deref().and_then(normalize_display_name),
            desired_room: persisted.desired_room.clone().or_else(|| Some(current_room.clone())),
            current_room,
            ..Self::default()
        }
    }

    /// Snapshot of the part worth persisting
    pub fn persisted(&self) -> PersistedSession {
        PersistedSession {
            name: self.name.clone(),
            current_room: Some(self.current_room.clone()),
            desired_room: self.desired_room.clone(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the display name (trimmed, truncated)
    pub fn set_name(&mut self, raw: &str) -> Result<String> {
        let name = normalize_display_name(raw)
            .ok_or_else(|| AppError::BadRequest("Display name must not be empty".to_string()))?;
        self.name = Some(name.clone());
        Ok(name)
    }

    /// Adopt the name the server recorded for us
    pub(crate) fn adopt_server_name(&mut self, name: &str) {
        if let Some(name) = normalize_display_name(name) {
            self.name = Some(name);
        }
    }

    pub fn desired_room(&self) -> Option<&str> {
        self.desired_room.as_deref()
    }

    pub fn current_room(&self) -> &str {
        &self.current_room
    }

    /// Room the reconciler should rejoin when we vanished from every room
    pub fn rejoin_target(&self) -> String {
        self.desired_room
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.current_room.clone())
    }

    /// Record a server-confirmed room; it also becomes the desired room
    pub fn remember_current_room(&mut self, room: &str) {
        let room = if room.is_empty() { LOBBY } else { room };
        self.current_room = room.to_string();
        self.desired_room = Some(room.to_string());
    }

    /// Withhold drift correction for `window` (clamped to [`MAX_SUPPRESSION`])
    pub fn suppress(&mut self, now: Instant, window: Duration) {
        self.suppressed_until = Some(now + window.min(MAX_SUPPRESSION));
    }

    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.suppressed_until.is_some_and(|deadline| now < deadline)
    }

    pub fn suppressed_until(&self) -> Option<Instant> {
        self.suppressed_until
    }

    /// Start a join request, returns its generation
    pub(crate) fn begin_join(&mut self) -> u64 {
        self.join_generation += 1;
        self.join_generation
    }

    /// Whether `generation` is still the newest join request
    pub(crate) fn is_latest_join(&self, generation: u64) -> bool {
        self.join_generation == generation
    }

    pub fn rooms(&self) -> &RoomSnapshot {
        &self.rooms
    }

    pub fn capacity(&self) -> &CapacityMap {
        &self.capacity
    }

    /// Store the membership and capacity the server reported
    ///
    /// Returns whether the snapshot changed.
    pub fn apply_snapshot(&mut self, rooms: RoomSnapshot, capacity: Option<&CapacityMap>) -> bool {
        let changed = self.rooms != rooms;
        self.rooms = rooms;
        if let Some(capacity) = capacity {
            self.capacity.merge(capacity);
        }
        changed
    }

    pub(crate) fn merge_capacity(&mut self, capacity: &CapacityMap) -> bool {
        self.capacity.merge(capacity)
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    pub(crate) fn set_session_id(&mut self, id: Option<i64>) {
        if id.is_some() {
            self.session_id = id;
        }
    }

    pub fn last_server_room(&self) -> Option<&str> {
        self.last_server_room.as_deref()
    }

    pub(crate) fn set_last_server_room(&mut self, room: Option<String>) {
        if room.is_some() {
            self.last_server_room = room;
        }
    }

    pub fn control(&self) -> &ControlLock {
        &self.control
    }

    pub(crate) fn control_mut(&mut self) -> &mut ControlLock {
        &mut self.control
    }

    /// Whether this client currently holds the control lock
    ///
    /// Matches on session id once the server told us ours, on display name
    /// before that.
    pub fn has_control(&self) -> bool {
        self.control.is_held_by(self.session_id, self.name.as_deref())
    }
}

/// Shared handle to the session
///
/// The lock is synchronous and must never be held across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<ClientSession>>,
}

impl SessionHandle {
    pub fn new(session: ClientSession) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    /// Read access through a closure
    pub fn read<R>(&self, f: impl FnOnce(&ClientSession) -> R) -> R {
        f(&self.inner.read())
    }

    /// Write access through a closure
    pub fn write<R>(&self, f: impl FnOnce(&mut ClientSession) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ClientSession {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_defaults_to_lobby() {
        let session = ClientSession::from_persisted(&PersistedSession::default());
        assert_eq!(session.current_room(), "lobby");
        assert_eq!(session.desired_room(), Some("lobby"));
        assert_eq!(session.name(), None);
    }

    #[test]
    fn test_restore_keeps_rooms() {
        let session = ClientSession::from_persisted(&PersistedSession {
            name: Some("  Alice ".to_string()),
            current_room: Some("mic1".to_string()),
            desired_room: Some("mic2".to_string()),
        });
        assert_eq!(session.name(), Some("Alice"));
        assert_eq!(session.current_room(), "mic1");
        assert_eq!(session.rejoin_target(), "mic2");
        assert_eq!(session.persisted().desired_room.as_deref(), Some("mic2"));
    }

    #[test]
    fn test_remember_current_room_updates_desired() {
        let mut session = ClientSession::new();
        session.remember_current_room("mic3");
        assert_eq!(session.current_room(), "mic3");
        assert_eq!(session.desired_room(), Some("mic3"));
        session.remember_current_room("");
        assert_eq!(session.current_room(), "lobby");
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_window() {
        let mut session = ClientSession::new();
        let now = Instant::now();
        assert!(!session.is_suppressed(now));

        session.suppress(now, Duration::from_millis(1500));
        assert!(session.is_suppressed(now));
        assert!(session.is_suppressed(now + Duration::from_millis(1499)));
        assert!(!session.is_suppressed(now + Duration::from_millis(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_is_clamped() {
        let mut session = ClientSession::new();
        let now = Instant::now();
        session.suppress(now, Duration::from_secs(3600));
        assert_eq!(session.suppressed_until(), Some(now + MAX_SUPPRESSION));
    }

    #[test]
    fn test_join_generation() {
        let mut session = ClientSession::new();
        let first = session.begin_join();
        assert!(session.is_latest_join(first));
        let second = session.begin_join();
        assert!(!session.is_latest_join(first));
        assert!(session.is_latest_join(second));
    }

    #[test]
    fn test_set_name_rejects_blank() {
        let mut session = ClientSession::new();
        assert!(session.set_name("   ").is_err());
        assert_eq!(session.set_name(" Bob ").unwrap(), "Bob");
    }

    #[test]
    fn test_handle_shares_state() {
        let handle = SessionHandle::default();
        let other = handle.clone();
        handle.write(|s| s.remember_current_room("mic4"));
        assert_eq!(other.read(|s| s.current_room().to_string()), "mic4");
    }
}
