//! Membership reconciliation
//!
//! The server decides who is in which room. Two producers report its view:
//! the status [`poller`] and the server-sent-events [`push`] channel. Both
//! feed one queue of [`MembershipUpdate`]s; the [`Reconciler`] stores each
//! snapshot and, outside a suppression window, corrects drift between
//! where we are listed and where we want to be.

pub mod poller;
pub mod push;

pub use poller::{StatusPoller, StatusSample};
pub use push::PushChannel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ConfigStore;
use crate::events::{ClientEvent, EventBus, UpdateSource};
use crate::join::{JoinOptions, JoinRequester};
use crate::rooms::{CapacityMap, RoomSnapshot};
use crate::session::{ClientSession, SessionHandle};

/// Queue depth between producers and the reconciler
const UPDATE_QUEUE_CAPACITY: usize = 32;

/// One report of the server's membership view
#[derive(Debug, Clone)]
pub struct MembershipUpdate {
    pub source: UpdateSource,
    /// `None` when the report only carried capacities
    pub rooms: Option<RoomSnapshot>,
    pub capacity: Option<CapacityMap>,
}

impl MembershipUpdate {
    /// Fold a newer update into this one
    fn absorb(&mut self, newer: MembershipUpdate) {
        self.source = newer.source;
        if newer.rooms.is_some() {
            self.rooms = newer.rooms;
        }
        if let Some(capacity) = newer.capacity {
            match self.capacity.as_mut() {
                Some(current) => {
                    current.merge(&capacity);
                }
                None => self.capacity = Some(capacity),
            }
        }
    }
}

/// What the reconciler decided for one update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// No display name yet
    Idle,
    /// Inside a suppression window
    Suppressed,
    /// Listed in our current room
    InSync,
    /// Listed in another room; the server wins
    Adopt(String),
    /// Listed nowhere; silently rejoin this room
    Rejoin(String),
}

/// Decide how to react to the snapshot held by `session`
pub fn plan(session: &ClientSession, now: Instant) -> Plan {
    let Some(name) = session.name() else {
        return Plan::Idle;
    };
    if session.is_suppressed(now) {
        return Plan::Suppressed;
    }

    let rooms = session.rooms();
    if rooms.contains(session.current_room(), name) {
        return Plan::InSync;
    }
    match rooms.locate(name) {
        Some(room) => Plan::Adopt(room.to_string()),
        None => Plan::Rejoin(session.rejoin_target()),
    }
}

/// Create the update queue shared by both producers
pub fn channel() -> (mpsc::Sender<MembershipUpdate>, mpsc::Receiver<MembershipUpdate>) {
    mpsc::channel(UPDATE_QUEUE_CAPACITY)
}

pub struct Reconciler {
    session: SessionHandle,
    joins: Arc<JoinRequester>,
    events: Arc<EventBus>,
    store: Option<ConfigStore>,
    /// Set while a drift-correction join is outstanding
    in_flight: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(session: SessionHandle, joins: Arc<JoinRequester>, events: Arc<EventBus>) -> Self {
        Self {
            session,
            joins,
            events,
            store: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Whether a reconciliation join is outstanding
    pub fn join_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Consume updates until cancelled or every producer is gone
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<MembershipUpdate>, cancel: CancellationToken) {
        loop {
            let mut update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            // Only the newest view matters when updates pile up
            while let Ok(newer) = rx.try_recv() {
                update.absorb(newer);
            }
            self.handle(update).await;
        }
        debug!("Reconciler stopped");
    }

    /// Store one update and act on it
    pub async fn handle(&self, update: MembershipUpdate) -> Plan {
        let source = update.source;
        let (snapshot_changed, decision) = self.session.write(|s| {
            let mut changed = false;
            match update.rooms {
                Some(rooms) => changed = s.apply_snapshot(rooms, update.capacity.as_ref()),
                None => {
                    if let Some(capacity) = &update.capacity {
                        s.merge_capacity(capacity);
                    }
                }
            }
            (changed, plan(s, Instant::now()))
        });

        if snapshot_changed {
            let rooms = self.session.read(|s| s.rooms().clone());
            self.events
                .publish(ClientEvent::RoomsUpdated { source, rooms });
        }
        trace!("Reconcile ({}): {:?}", source, decision);

        match &decision {
            Plan::Adopt(room) => self.adopt(room).await,
            Plan::Rejoin(room) => self.rejoin(room.clone()),
            Plan::Idle | Plan::Suppressed | Plan::InSync => {}
        }
        decision
    }

    async fn adopt(&self, room: &str) {
        let (previous, persisted) = self.session.write(|s| {
            let previous = s.current_room().to_string();
            s.remember_current_room(room);
            (previous, s.persisted())
        });
        info!("Server lists us in {}, adopting it (was {})", room, previous);
        self.events.publish(ClientEvent::CurrentRoomChanged {
            from: previous,
            to: room.to_string(),
        });
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(&persisted).await {
                debug!("Failed to persist adopted room: {}", e);
            }
        }
    }

    /// Start a silent rejoin unless one is already running
    fn rejoin(&self, room: String) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Rejoin to {} coalesced into the outstanding one", room);
            return;
        }

        info!("Not listed in any room, rejoining {}", room);
        let joins = self.joins.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            // Failures are retried on the next update
            if let Err(e) = joins.join(&room, JoinOptions::silent()).await {
                debug!("Reconcile rejoin to {} failed: {}", room, e);
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::join::tests::ScriptedBackend;
    use std::time::Duration;

    fn update(rooms: RoomSnapshot) -> MembershipUpdate {
        MembershipUpdate {
            source: UpdateSource::Poll,
            rooms: Some(rooms),
            capacity: None,
        }
    }

    fn setup(name: Option<&str>) -> (Arc<ScriptedBackend>, SessionHandle, Reconciler) {
        let backend = Arc::new(ScriptedBackend::default());
        let session = SessionHandle::default();
        if let Some(name) = name {
            session.write(|s| s.set_name(name).unwrap());
        }
        let events = Arc::new(EventBus::new());
        let joins = Arc::new(JoinRequester::new(
            backend.clone(),
            session.clone(),
            events.clone(),
            TimingConfig::default(),
            0,
        ));
        let reconciler = Reconciler::new(session.clone(), joins, events);
        (backend, session, reconciler)
    }

    #[test]
    fn test_plan_in_sync() {
        let mut session = ClientSession::new();
        session.set_name("Alice").unwrap();
        session.remember_current_room("mic2");
        session.apply_snapshot(
            RoomSnapshot::from([("lobby", &[][..]), ("mic2", &["Alice"][..])]),
            None,
        );
        assert_eq!(plan(&session, Instant::now()), Plan::InSync);
    }

    #[test]
    fn test_plan_adopts_server_room() {
        let mut session = ClientSession::new();
        session.set_name("Alice").unwrap();
        session.remember_current_room("mic2");
        session.apply_snapshot(RoomSnapshot::from([("mic5", &["Alice"][..])]), None);
        assert_eq!(plan(&session, Instant::now()), Plan::Adopt("mic5".to_string()));
    }

    #[test]
    fn test_plan_rejoins_desired_room() {
        let mut session = ClientSession::new();
        session.set_name("Alice").unwrap();
        session.remember_current_room("mic2");
        session.apply_snapshot(RoomSnapshot::from([("mic2", &["Bob"][..])]), None);
        assert_eq!(plan(&session, Instant::now()), Plan::Rejoin("mic2".to_string()));
    }

    #[test]
    fn test_plan_without_name_is_idle() {
        let session = ClientSession::new();
        assert_eq!(plan(&session, Instant::now()), Plan::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_withholds_requests() {
        let (backend, session, reconciler) = setup(Some("Alice"));
        session.write(|s| {
            s.remember_current_room("mic1");
            s.suppress(Instant::now(), Duration::from_secs(4));
        });

        let decision = reconciler.handle(update(RoomSnapshot::from([("lobby", &[][..])]))).await;
        assert_eq!(decision, Plan::Suppressed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.joins.lock().is_empty());
        // The snapshot is still stored
        assert!(session.read(|s| s.rooms().has_room("lobby")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kicked_client_rejoins_desired_room() {
        let (backend, session, reconciler) = setup(Some("Alice"));
        session.write(|s| s.remember_current_room("mic2"));
        backend.push(ScriptedBackend::joined(
            "mic2",
            RoomSnapshot::from([("mic2", &["Alice"][..])]),
        ));

        let decision = reconciler
            .handle(update(RoomSnapshot::from([("lobby", &[][..]), ("mic2", &[][..])])))
            .await;
        assert_eq!(decision, Plan::Rejoin("mic2".to_string()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.joins.lock().len(), 1);
        assert_eq!(backend.joins.lock()[0].0, "mic2");
        assert!(!reconciler.join_in_flight());
        assert!(session.read(|s| s.rooms().contains("mic2", "Alice")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rejoins_are_coalesced() {
        let (backend, _session, reconciler) = setup(Some("Alice"));
        let empty = RoomSnapshot::from([("lobby", &[][..])]);

        reconciler.handle(update(empty.clone())).await;
        assert!(reconciler.join_in_flight());
        // Second trigger before the first join ran
        let decision = reconciler.handle(update(empty)).await;
        assert_eq!(decision, Plan::Rejoin("lobby".to_string()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.joins.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopt_updates_current_room() {
        let (backend, session, reconciler) = setup(Some("Alice"));
        session.write(|s| s.remember_current_room("mic1"));

        let decision = reconciler
            .handle(update(RoomSnapshot::from([("mic4", &["Alice"][..])])))
            .await;
        assert_eq!(decision, Plan::Adopt("mic4".to_string()));
        assert_eq!(session.read(|s| s.current_room().to_string()), "mic4");
        assert_eq!(session.read(|s| s.desired_room().map(str::to_string)), Some("mic4".to_string()));
        assert!(backend.joins.lock().is_empty());
    }

    #[test]
    fn test_absorb_keeps_latest_rooms_and_merges_capacity() {
        let mut first = MembershipUpdate {
            source: UpdateSource::Poll,
            rooms: Some(RoomSnapshot::from([("mic1", &["Bob"][..])])),
            capacity: Some(CapacityMap::uniform(4)),
        };
        let mut capacity = CapacityMap::new();
        capacity.set("mic1", 2);
        first.absorb(MembershipUpdate {
            source: UpdateSource::Push,
            rooms: None,
            capacity: Some(capacity),
        });
        assert_eq!(first.source, UpdateSource::Push);
        assert!(first.rooms.as_ref().unwrap().contains("mic1", "Bob"));
        let capacity = first.capacity.unwrap();
        assert_eq!(capacity.limit("mic1"), 2);
        assert_eq!(capacity.limit("mic2"), 4);
    }
}
