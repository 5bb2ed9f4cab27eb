//! Client orchestrator
//!
//! [`MicClient`] owns the shared session, the backend and every subsystem.
//! One-shot operations (join, kick, capacity...) can be called right after
//! construction; [`MicClient::start`] additionally spawns the background
//! tasks (poller, push channel, reconciler, media, health, metrics) under
//! child tokens of one [`CancellationToken`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Backend, HttpBackend, PlaylistStatus, SongId, SongItem, UplAction, UplChange};
use crate::config::{ClientConfig, ConfigStore};
use crate::control::{ControlClient, ControlLock, KeystrokeSync, Keystroke, TextDiff};
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus, Severity, UpdateSource};
use crate::health::HealthMonitor;
use crate::join::{JoinFailure, JoinOptions, JoinOutcome, JoinRequester};
use crate::media::{LevelMeter, MicPublisher};
use crate::metrics::MetricsReporter;
use crate::reconcile::poller::StatusPoller;
use crate::reconcile::push::PushChannel;
use crate::reconcile::{self, Reconciler};
use crate::reconnect::{Backoff, MediaFailure, MediaSession, ReconnectSupervisor};
use crate::rooms::{
    clamp_capacity, format_capacity_label, CapacityMap, RoomSnapshot, LOBBY, MIC_ROOMS,
};
use crate::session::{ClientSession, SessionHandle};

/// Allowed range of the per-player delay (ms)
pub const DELAY_RANGE_MS: std::ops::RangeInclusive<i64> = -1000..=1000;

/// Hits requested per song search
pub const SONG_PAGE_SIZE: u32 = 100;

pub struct MicClient {
    /// Configuration and persisted session
    store: ConfigStore,
    /// Configuration the client was built with
    config: Arc<ClientConfig>,
    session: SessionHandle,
    /// Event bus for client notifications
    events: Arc<EventBus>,
    backend: Arc<dyn Backend>,
    joins: Arc<JoinRequester>,
    control: Arc<ControlClient>,
    keyboard: KeystrokeSync,
    meter: Arc<LevelMeter>,
    publisher: Mutex<Option<Arc<MicPublisher>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MicClient {
    /// Build a client talking HTTP to the configured server
    pub async fn new(store: ConfigStore) -> Result<Arc<Self>> {
        let config = store.get();
        Self::with_config(store, config).await
    }

    /// Build a client on `config` instead of the stored configuration
    ///
    /// Runtime overrides (command line flags) go here; they are never
    /// written back to `store`.
    pub async fn with_config(store: ConfigStore, config: Arc<ClientConfig>) -> Result<Arc<Self>> {
        let backend = Arc::new(HttpBackend::new(&config.server)?);
        Self::build(store, config, backend).await
    }

    /// Build a client on an arbitrary backend
    pub async fn with_backend(store: ConfigStore, backend: Arc<dyn Backend>) -> Result<Arc<Self>> {
        let config = store.get();
        Self::build(store, config, backend).await
    }

    async fn build(
        store: ConfigStore,
        config: Arc<ClientConfig>,
        backend: Arc<dyn Backend>,
    ) -> Result<Arc<Self>> {
        let persisted = store.load_session().await?;
        let session = SessionHandle::new(ClientSession::from_persisted(&persisted));
        let events = Arc::new(EventBus::new());

        let joins = Arc::new(
            JoinRequester::new(
                backend.clone(),
                session.clone(),
                events.clone(),
                config.timing.clone(),
                config.rooms.delay_ms,
            )
            .with_store(store.clone()),
        );
        let control = Arc::new(ControlClient::new(
            backend.clone(),
            session.clone(),
            events.clone(),
            config.control.password.clone(),
        ));
        let keyboard = KeystrokeSync::new(backend.clone(), session.clone());
        let meter = Arc::new(LevelMeter::new(config.health.active_level));

        Ok(Arc::new(Self {
            store,
            config,
            session,
            events,
            backend,
            joins,
            control,
            keyboard,
            meter,
            publisher: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Copy of the local state cache
    pub fn snapshot(&self) -> ClientSession {
        self.session.snapshot()
    }

    pub fn meter(&self) -> &Arc<LevelMeter> {
        &self.meter
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    async fn persist_session(&self) {
        let persisted = self.session.read(|s| s.persisted());
        if let Err(e) = self.store.save_session(&persisted).await {
            warn!("Failed to persist session: {}", e);
        }
    }

    /// Spawn the background tasks and bring up the microphone
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config.clone();
        let (updates_tx, updates_rx) = reconcile::channel();

        let reconciler = Arc::new(
            Reconciler::new(self.session.clone(), self.joins.clone(), self.events.clone())
                .with_store(self.store.clone()),
        );
        self.spawn(reconciler.run(updates_rx, self.cancel.child_token()));

        let poller = Arc::new(StatusPoller::new(
            self.backend.clone(),
            self.session.clone(),
            self.control.clone(),
            updates_tx.clone(),
            Duration::from_millis(config.timing.poll_interval_ms),
        ));
        let samples = poller.samples();
        self.spawn(poller.run(self.cancel.child_token()));

        let push = PushChannel::new(
            self.backend.clone(),
            updates_tx,
            Duration::from_millis(config.timing.push_retry_ms),
        );
        self.spawn(push.run(self.cancel.child_token()));

        if config.rooms.rejoin_on_start && self.session.read(|s| s.name().is_some()) {
            let room = self.session.read(|s| s.rejoin_target());
            info!("Rejoining {} on start", room);
            if let Err(e) = self.joins.join(&room, JoinOptions::silent()).await {
                warn!("Start-up rejoin of {} failed: {}", room, e);
            }
        }

        if config.media.control_only {
            info!("Control-only mode, not publishing a microphone");
            return Ok(());
        }

        let publisher = Arc::new(MicPublisher::new(
            self.backend.clone(),
            self.events.clone(),
            config.media.clone(),
            self.meter.clone(),
        ));
        let (supervisor, failures) = ReconnectSupervisor::new(
            publisher.clone(),
            self.joins.clone(),
            self.session.clone(),
            self.events.clone(),
            Backoff::from_config(&config.reconnect),
        );
        publisher.attach_failures(failures.clone());
        self.spawn(supervisor.run(self.cancel.child_token()));
        *self.publisher.lock() = Some(publisher.clone());

        if let Err(e) = publisher.connect().await {
            warn!("Microphone connect failed: {}", e);
            self.events.publish(ClientEvent::SystemError {
                module: "media".to_string(),
                message: e.to_string(),
            });
            let _ = failures.send(MediaFailure::Connect(e.to_string()));
        }

        if config.health.enabled {
            let monitor = HealthMonitor::new(
                self.session.clone(),
                self.joins.clone(),
                self.events.clone(),
                self.meter.clone(),
                config.health.clone(),
            );
            self.spawn(monitor.run(samples.clone(), self.cancel.child_token()));
        }

        if config.timing.metrics_interval_ms > 0 {
            let reporter = MetricsReporter::new(
                self.backend.clone(),
                self.meter.clone(),
                samples,
                Duration::from_millis(config.timing.metrics_interval_ms),
            );
            self.spawn(reporter.run(self.cancel.child_token()));
        }

        Ok(())
    }

    /// Join a room on the user's behalf
    pub async fn join(&self, room: &str) -> std::result::Result<JoinOutcome, JoinFailure> {
        self.joins.join(room, JoinOptions::user()).await
    }

    /// Leave every room; the client then counts as being in the lobby
    ///
    /// Supersedes any join still in flight. Once the suppression window
    /// ends the reconciler silently re-registers us in the lobby, since the
    /// server drops a leaving member from every room.
    pub async fn leave(&self) -> Result<()> {
        let window = Duration::from_millis(self.config.timing.join_suppress_ms);
        let (name, generation) = self.session.write(|s| {
            s.suppress(Instant::now(), window);
            (s.name().map(str::to_string), s.begin_join())
        });
        let update = self.backend.leave(name.as_deref()).await?;

        let applied = self.session.write(|s| {
            if !s.is_latest_join(generation) {
                return None;
            }
            let changed = match update.rooms {
                Some(rooms) => s.apply_snapshot(rooms, update.capacity.as_ref()),
                None => false,
            };
            let from = s.current_room().to_string();
            s.remember_current_room(LOBBY);
            Some((from, changed))
        });
        let Some((from, changed)) = applied else {
            debug!("Leave superseded by a newer join");
            return Ok(());
        };
        if changed {
            let rooms = self.session.read(|s| s.rooms().clone());
            self.events.publish(ClientEvent::RoomsUpdated {
                source: UpdateSource::Request,
                rooms,
            });
        }
        if from != LOBBY {
            self.events.publish(ClientEvent::CurrentRoomChanged {
                from,
                to: LOBBY.to_string(),
            });
        }
        self.persist_session().await;
        info!("Left all rooms");
        Ok(())
    }

    /// Remove another member from their room
    pub async fn kick(&self, name: &str) -> Result<()> {
        match self.backend.kick(name).await {
            Ok(rooms) => {
                if let Some(rooms) = rooms {
                    if self.session.write(|s| s.apply_snapshot(rooms.clone(), None)) {
                        self.events.publish(ClientEvent::RoomsUpdated {
                            source: UpdateSource::Request,
                            rooms,
                        });
                    }
                }
                info!("{} was kicked", name);
                self.events
                    .message(Severity::Info, format!("{} was kicked.", name));
                Ok(())
            }
            Err(e) => {
                warn!("Kick error: {}", e);
                Err(e)
            }
        }
    }

    /// Give every mic room the same capacity
    pub async fn set_capacity(&self, limit: u32) -> Result<CapacityMap> {
        if !self.control.has_control() {
            self.events
                .message(Severity::Warn, "Acquire control to change channel limits.");
            return Err(AppError::ControlRequired(
                "Acquire control to change channel limits".to_string(),
            ));
        }

        let limit = clamp_capacity(limit);
        let mut requested = CapacityMap::new();
        for room in MIC_ROOMS {
            requested.set(room, limit);
        }

        match self.backend.set_capacity(&requested).await {
            Ok(capacity) => {
                self.session.write(|s| s.merge_capacity(&capacity));
                self.events.message(
                    Severity::Info,
                    format!("All mic rooms now allow {}.", format_capacity_label(limit)),
                );
                Ok(capacity)
            }
            Err(e) => {
                warn!("Failed to update capacity: {}", e);
                let text = match &e {
                    AppError::Rejected { message, .. } | AppError::ControlRequired(message) => {
                        message.clone()
                    }
                    other => other.to_string(),
                };
                self.events.message(Severity::Warn, text);
                Err(e)
            }
        }
    }

    /// Fetch membership and capacity
    pub async fn refresh_rooms(&self) -> Result<RoomSnapshot> {
        let update = self.backend.rooms().await?;
        let rooms = update.rooms.unwrap_or_default();
        let changed = self
            .session
            .write(|s| s.apply_snapshot(rooms.clone(), update.capacity.as_ref()));
        if changed {
            self.events.publish(ClientEvent::RoomsUpdated {
                source: UpdateSource::Request,
                rooms: rooms.clone(),
            });
        }
        Ok(rooms)
    }

    /// Change the per-player delay
    ///
    /// The value is clamped, stored locally and used by every later join.
    /// The server update is best effort.
    pub async fn set_delay(&self, delay_ms: i64) -> Result<i64> {
        let delay_ms = delay_ms.clamp(*DELAY_RANGE_MS.start(), *DELAY_RANGE_MS.end());
        self.joins.set_delay_ms(delay_ms);
        self.store.update(|c| c.rooms.delay_ms = delay_ms).await?;

        match self.backend.set_delay(delay_ms).await {
            Ok(stored) => debug!("Server stored delay {}ms", stored),
            Err(e) => warn!("Failed to send delay to server: {}", e),
        }
        Ok(delay_ms)
    }

    /// Set and persist the display name
    pub async fn set_name(&self, raw: &str) -> Result<String> {
        let name = self.session.write(|s| s.set_name(raw))?;
        self.persist_session().await;
        Ok(name)
    }

    pub fn control_lock(&self) -> ControlLock {
        self.control.lock()
    }

    pub async fn refresh_control(&self) -> Result<ControlLock> {
        self.control.refresh().await
    }

    pub async fn acquire_control(&self) -> Result<()> {
        self.control.refresh().await.ok();
        self.control.acquire().await
    }

    pub async fn release_control(&self) -> Result<()> {
        self.control.release().await
    }

    /// Bring the remote keyboard text to `text`
    pub async fn type_text(&self, text: &str) -> Result<TextDiff> {
        self.keyboard.sync_to(text).await
    }

    pub async fn send_key(&self, key: Keystroke) -> Result<()> {
        self.keyboard.send_key(key).await
    }

    /// Search the song catalogue
    pub async fn search_songs(&self, query: &str) -> Result<Vec<SongItem>> {
        let query = query.trim();
        match self.backend.search_songs(query, SONG_PAGE_SIZE).await {
            Ok(items) => {
                debug!("Song search {:?}: {} hits", query, items.len());
                Ok(items)
            }
            Err(e) => {
                warn!("Search error: {}", e);
                Err(e)
            }
        }
    }

    /// Add a song to or remove it from the user playlist
    pub async fn set_upl(&self, id: &SongId, action: UplAction) -> Result<UplChange> {
        match self.backend.set_upl(id, action).await {
            Ok(change) => {
                let verb = if change.upl { "Added to" } else { "Removed from" };
                let line = change.line.clone().unwrap_or_else(|| id.to_string());
                info!("{} upl: {}", verb, line);
                self.events
                    .message(Severity::Ok, format!("{} upl: {}", verb, line));
                Ok(change)
            }
            Err(e) => {
                let text = match &e {
                    AppError::Rejected { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                warn!("Failed to modify upl: {}", text);
                self.events
                    .message(Severity::Warn, format!("Failed to modify upl: {}", text));
                Err(e)
            }
        }
    }

    pub async fn playlist_status(&self) -> Result<PlaylistStatus> {
        self.backend.playlist_status().await
    }

    /// Flip playlist mode; a positive `countdown_seconds` also sets the pause
    pub async fn toggle_playlist(&self, countdown_seconds: Option<u32>) -> Result<PlaylistStatus> {
        let enable = !self.backend.playlist_status().await?.enabled;
        match self.backend.toggle_playlist(enable, countdown_seconds).await {
            Ok(status) => {
                let state = if status.enabled { "enabled" } else { "disabled" };
                info!("Playlist mode {}", state);
                self.events
                    .message(Severity::Info, format!("Playlist mode {}.", state));
                Ok(status)
            }
            Err(e) => {
                warn!("Playlist toggle error: {}", e);
                self.events
                    .message(Severity::Warn, format!("Playlist toggle error: {}", e));
                Err(e)
            }
        }
    }

    /// Stop everything and say goodbye to the server
    pub async fn shutdown(&self) {
        info!("Shutting down client");
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }

        let publisher = self.publisher.lock().take();
        if let Some(publisher) = publisher {
            publisher.close().await;
        }

        if let Err(e) = self.control.release_if_held().await {
            warn!("Failed to release control on shutdown: {}", e);
        }
        if let Err(e) = self.backend.disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
        self.persist_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ControlStatus, JoinReply, RoomsUpdate, StatusReport};
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeServer {
        calls: Mutex<Vec<String>>,
        playlist_on: Mutex<bool>,
    }

    #[async_trait]
    impl Backend for FakeServer {
        async fn join(&self, room: &str, name: &str, delay_ms: i64) -> Result<JoinReply> {
            self.calls
                .lock()
                .push(format!("join {} {} {}", room, name, delay_ms));
            Ok(JoinReply::Joined {
                room: room.to_string(),
                name: Some(name.to_string()),
                rooms: Some(RoomSnapshot::from([(room, &[name][..])])),
                capacity: Some(CapacityMap::uniform(6)),
            })
        }

        async fn status(&self) -> Result<StatusReport> {
            Ok(StatusReport::default())
        }

        async fn leave(&self, name: Option<&str>) -> Result<RoomsUpdate> {
            self.calls.lock().push(format!("leave {:?}", name));
            Ok(RoomsUpdate {
                rooms: Some(RoomSnapshot::from([("lobby", &[][..])])),
                capacity: None,
            })
        }

        async fn set_capacity(&self, capacity: &CapacityMap) -> Result<CapacityMap> {
            self.calls
                .lock()
                .push(format!("capacity {}", capacity.limit("mic6")));
            Ok(capacity.clone())
        }

        async fn acquire_control(&self, name: &str) -> Result<ControlStatus> {
            self.calls.lock().push(format!("acquire {}", name));
            Ok(ControlStatus {
                owner: Some(3),
                owner_name: Some(name.to_string()),
                ..Default::default()
            })
        }

        async fn set_delay(&self, delay_ms: i64) -> Result<i64> {
            self.calls.lock().push(format!("delay {}", delay_ms));
            Ok(delay_ms)
        }

        async fn search_songs(&self, query: &str, per_page: u32) -> Result<Vec<SongItem>> {
            self.calls
                .lock()
                .push(format!("search {} {}", query, per_page));
            Ok(vec![SongItem {
                id: Some(SongId::Number(12)),
                display: "ABBA - Waterloo".to_string(),
                mp3: None,
                upl: false,
            }])
        }

        async fn set_upl(&self, id: &SongId, action: UplAction) -> Result<UplChange> {
            self.calls.lock().push(format!("upl {} {:?}", id, action));
            if *id == SongId::Text("gone".to_string()) {
                return Err(AppError::rejected(None, "Unknown song"));
            }
            Ok(UplChange {
                upl: action == UplAction::Add,
                line: Some("ABBA - Waterloo".to_string()),
            })
        }

        async fn playlist_status(&self) -> Result<PlaylistStatus> {
            Ok(PlaylistStatus {
                enabled: *self.playlist_on.lock(),
                ..Default::default()
            })
        }

        async fn toggle_playlist(
            &self,
            enabled: bool,
            countdown_seconds: Option<u32>,
        ) -> Result<PlaylistStatus> {
            self.calls
                .lock()
                .push(format!("playlist {} {:?}", enabled, countdown_seconds));
            *self.playlist_on.lock() = enabled;
            Ok(PlaylistStatus {
                enabled,
                countdown_seconds: countdown_seconds.map(f64::from),
                ..Default::default()
            })
        }
    }

    async fn client(dir: &TempDir, backend: Arc<FakeServer>) -> Arc<MicClient> {
        let store = ConfigStore::new(&dir.path().join("smartmic.db")).await.unwrap();
        MicClient::with_backend(store, backend).await.unwrap()
    }

    #[tokio::test]
    async fn test_name_and_room_survive_restart() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        {
            let client = client(&dir, backend.clone()).await;
            assert_eq!(client.set_name("  Alice  ").await.unwrap(), "Alice");
            client.join("mic2").await.unwrap();
        }

        let client = client(&dir, backend).await;
        let session = client.snapshot();
        assert_eq!(session.name(), Some("Alice"));
        assert_eq!(session.current_room(), "mic2");
        assert_eq!(session.desired_room(), Some("mic2"));
    }

    #[tokio::test]
    async fn test_capacity_needs_control() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        let client = client(&dir, backend.clone()).await;
        let mut rx = client.subscribe();

        let err = client.set_capacity(3).await.unwrap_err();
        assert!(matches!(err, AppError::ControlRequired(_)));
        assert!(backend.calls.lock().is_empty());
        match rx.try_recv().unwrap() {
            ClientEvent::RoomMessage { text, .. } => {
                assert_eq!(text, "Acquire control to change channel limits.")
            }
            other => panic!("unexpected event: {:?}", other),
        }

        client.set_name("Bob").await.unwrap();
        client.acquire_control().await.unwrap();
        let capacity = client.set_capacity(9).await.unwrap();
        assert_eq!(capacity.limit("mic1"), 6);
        assert_eq!(backend.calls.lock().last().unwrap(), "capacity 6");
        assert_eq!(client.snapshot().capacity().limit("mic6"), 6);
    }

    #[tokio::test]
    async fn test_delay_is_clamped_and_used_for_joins() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        let client = client(&dir, backend.clone()).await;

        assert_eq!(client.set_delay(2500).await.unwrap(), 1000);
        assert_eq!(client.store.get().rooms.delay_ms, 1000);

        client.set_name("Cara").await.unwrap();
        client.join("mic1").await.unwrap();
        assert_eq!(
            backend.calls.lock().as_slice(),
            ["delay 1000".to_string(), "join mic1 Cara 1000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_leave_returns_to_lobby() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        let client = client(&dir, backend.clone()).await;
        client.set_name("Dee").await.unwrap();
        client.join("mic4").await.unwrap();

        client.leave().await.unwrap();
        assert_eq!(client.snapshot().current_room(), LOBBY);
        assert_eq!(backend.calls.lock().last().unwrap(), "leave Some(\"Dee\")");
    }

    #[tokio::test]
    async fn test_song_search_and_upl_messages() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        let client = client(&dir, backend.clone()).await;
        let mut rx = client.subscribe();

        let items = client.search_songs("  abba ").await.unwrap();
        assert_eq!(items[0].display, "ABBA - Waterloo");
        assert_eq!(backend.calls.lock()[0], "search abba 100");

        let id = items[0].id.clone().unwrap();
        assert!(client.set_upl(&id, UplAction::Add).await.unwrap().upl);
        assert!(!client.set_upl(&id, UplAction::Remove).await.unwrap().upl);
        assert!(client
            .set_upl(&SongId::Text("gone".to_string()), UplAction::Add)
            .await
            .is_err());

        let texts: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                ClientEvent::RoomMessage { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            [
                "Added to upl: ABBA - Waterloo",
                "Removed from upl: ABBA - Waterloo",
                "Failed to modify upl: Unknown song",
            ]
        );
    }

    #[tokio::test]
    async fn test_toggle_playlist_flips_mode() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeServer::default());
        let client = client(&dir, backend.clone()).await;

        let status = client.toggle_playlist(Some(20)).await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.countdown_seconds, Some(20.0));
        assert!(client.playlist_status().await.unwrap().enabled);

        let status = client.toggle_playlist(None).await.unwrap();
        assert!(!status.enabled);
        assert_eq!(
            backend.calls.lock().as_slice(),
            ["playlist true Some(20)".to_string(), "playlist false None".to_string()]
        );
    }

    /// Join that waits until the test lets it answer
    #[derive(Default)]
    struct HeldJoin {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Backend for HeldJoin {
        async fn join(&self, room: &str, name: &str, _delay_ms: i64) -> Result<JoinReply> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(JoinReply::Joined {
                room: room.to_string(),
                name: Some(name.to_string()),
                rooms: Some(RoomSnapshot::from([(room, &[name][..])])),
                capacity: None,
            })
        }

        async fn status(&self) -> Result<StatusReport> {
            Ok(StatusReport::default())
        }

        async fn leave(&self, _name: Option<&str>) -> Result<RoomsUpdate> {
            Ok(RoomsUpdate {
                rooms: Some(RoomSnapshot::from([("lobby", &[][..])])),
                capacity: None,
            })
        }
    }

    #[tokio::test]
    async fn test_leave_supersedes_pending_join() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(HeldJoin::default());
        let store = ConfigStore::new(&dir.path().join("smartmic.db")).await.unwrap();
        let client = MicClient::with_backend(store, backend.clone()).await.unwrap();
        client.set_name("Eve").await.unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.join("mic5").await }
        });
        backend.entered.notified().await;

        client.leave().await.unwrap();
        backend.release.notify_one();
        assert_eq!(pending.await.unwrap(), Ok(JoinOutcome::Superseded));

        let session = client.snapshot();
        assert_eq!(session.current_room(), LOBBY);
        assert!(session.is_suppressed(Instant::now()));
    }

    #[tokio::test]
    async fn test_control_only_override_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("smartmic.db");
        let store = ConfigStore::new(&db_path).await.unwrap();
        let mut config = (*store.get()).clone();
        config.media.control_only = true;
        config.rooms.rejoin_on_start = false;

        let client = MicClient::build(
            store.clone(),
            Arc::new(config),
            Arc::new(FakeServer::default()),
        )
        .await
        .unwrap();
        client.start().await.unwrap();
        assert!(client.publisher.lock().is_none());
        client.shutdown().await;

        assert!(!store.get().media.control_only);
        let reopened = ConfigStore::new(&db_path).await.unwrap();
        assert!(!reopened.get().media.control_only);
    }

    #[tokio::test]
    async fn test_control_only_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(&dir.path().join("smartmic.db")).await.unwrap();
        store
            .update(|c| {
                c.media.control_only = true;
                c.rooms.rejoin_on_start = false;
            })
            .await
            .unwrap();
        let client = MicClient::with_backend(store, Arc::new(FakeServer::default()))
            .await
            .unwrap();

        client.start().await.unwrap();
        assert!(client.publisher.lock().is_none());
        client.shutdown().await;
        assert!(client.tasks.lock().is_empty());
    }
}
