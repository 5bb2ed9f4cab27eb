//! Audio liveness monitor
//!
//! Every status poll reports when the server last received our audio. If
//! that goes stale while the local microphone is clearly picking something
//! up, the media path is wedged somewhere between us and the server; a
//! silent hop through the lobby makes the server rebuild our routing.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::events::{ClientEvent, EventBus, Severity};
use crate::join::{JoinOptions, JoinRequester};
use crate::media::LevelMeter;
use crate::reconcile::poller::StatusSample;
use crate::rooms::LOBBY;
use crate::session::SessionHandle;

/// What one status sample says about our audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Server hears us, or there is nothing to judge
    Healthy,
    /// Stale, but we already reacted recently
    Cooldown,
    /// Stale while the mic is active: hop through the lobby
    Intervene,
    /// Stale and the mic is quiet: only tell the user
    SilentMic,
}

pub struct HealthMonitor {
    session: SessionHandle,
    joins: Arc<JoinRequester>,
    events: Arc<EventBus>,
    meter: Arc<LevelMeter>,
    config: HealthConfig,
    last_warning: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(
        session: SessionHandle,
        joins: Arc<JoinRequester>,
        events: Arc<EventBus>,
        meter: Arc<LevelMeter>,
        config: HealthConfig,
    ) -> Self {
        Self {
            session,
            joins,
            events,
            meter,
            config,
            last_warning: None,
        }
    }

    fn threshold(&self) -> Duration {
        Duration::from_secs_f64(self.config.silence_threshold_secs.clamp(0.3, 10.0))
    }

    /// How long the server may go without our audio
    pub fn server_stale_after(&self) -> Duration {
        self.threshold().max(Duration::from_secs(4))
    }

    /// How recently the mic must have been active to blame the transport
    pub fn local_active_window(&self) -> Duration {
        self.threshold().max(Duration::from_secs(2))
    }

    /// Judge a sample; a non-healthy verdict starts the cooldown
    pub fn check(&mut self, sample: &StatusSample) -> Verdict {
        if !self.meter.has_signal() {
            return Verdict::Healthy;
        }
        let Some(silence) = sample.audio_silence_secs() else {
            return Verdict::Healthy;
        };
        if silence <= self.server_stale_after().as_secs_f64() {
            return Verdict::Healthy;
        }

        let now = Instant::now();
        let cooldown = Duration::from_secs(self.config.warning_cooldown_secs);
        if self
            .last_warning
            .is_some_and(|at| now.duration_since(at) < cooldown)
        {
            return Verdict::Cooldown;
        }
        self.last_warning = Some(now);

        if self.meter.active_within(self.local_active_window()) {
            Verdict::Intervene
        } else {
            Verdict::SilentMic
        }
    }

    /// Lobby hop; returns the room we went back to, if any
    pub async fn intervene(&self) -> Option<String> {
        let (room, named, suppressed) = self.session.read(|s| {
            (
                s.rejoin_target(),
                s.name().is_some(),
                s.is_suppressed(Instant::now()),
            )
        });
        if !named || room == LOBBY || suppressed {
            debug!("Skipping audio intervention (room {}, suppressed {})", room, suppressed);
            return None;
        }

        warn!("Server stopped receiving our audio, hopping through the lobby");
        self.events
            .message(Severity::Warn, "Connection unstable, reconnecting...");

        if let Err(e) = self.joins.join(LOBBY, JoinOptions::silent()).await {
            warn!("Intervention lobby join failed: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(self.config.hop_pause_ms)).await;
        if let Err(e) = self.joins.join(&room, JoinOptions::silent()).await {
            warn!("Intervention rejoin of {} failed: {}", room, e);
        }

        self.events.publish(ClientEvent::Intervention {
            room: room.clone(),
            at: Utc::now(),
        });
        Some(room)
    }

    pub async fn handle(&mut self, sample: &StatusSample) -> Verdict {
        let verdict = self.check(sample);
        match verdict {
            Verdict::Intervene => {
                self.intervene().await;
            }
            Verdict::SilentMic => {
                info!("Server hears nothing and the microphone is quiet");
                self.events.message(
                    Severity::Warn,
                    "Microphone appears silent. If this is unexpected, check mic access.",
                );
            }
            Verdict::Healthy | Verdict::Cooldown => {}
        }
        verdict
    }

    pub async fn run(
        mut self,
        mut samples: watch::Receiver<Option<StatusSample>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = samples.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let sample = samples.borrow_and_update().clone();
            if let Some(sample) = sample {
                self.handle(&sample).await;
            }
        }
        debug!("Audio health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::YouInfo;
    use crate::config::TimingConfig;
    use crate::join::tests::ScriptedBackend;
    use crate::rooms::RoomSnapshot;

    fn sample(silence_secs: f64) -> StatusSample {
        let now = Utc::now();
        StatusSample {
            latency: Duration::from_millis(40),
            you: Some(YouInfo {
                session_id: Some(1),
                name: Some("Alice".to_string()),
                room: Some("mic2".to_string()),
                audio_last_seen: Some(now.timestamp_millis() as f64 / 1000.0 - silence_secs),
            }),
            received_at: now,
        }
    }

    fn monitor(backend: Arc<ScriptedBackend>) -> (HealthMonitor, Arc<LevelMeter>, Arc<EventBus>) {
        let session = SessionHandle::default();
        session.write(|s| {
            s.set_name("Alice").unwrap();
            s.remember_current_room("mic2");
        });
        let events = Arc::new(EventBus::new());
        let joins = Arc::new(JoinRequester::new(
            backend,
            session.clone(),
            events.clone(),
            TimingConfig::default(),
            0,
        ));
        let meter = Arc::new(LevelMeter::new(0.02));
        let monitor = HealthMonitor::new(
            session,
            joins,
            events.clone(),
            meter.clone(),
            HealthConfig::default(),
        );
        (monitor, meter, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds() {
        let (mut monitor, meter, _) = monitor(Arc::new(ScriptedBackend::default()));
        assert_eq!(monitor.server_stale_after(), Duration::from_secs(5));
        assert_eq!(monitor.local_active_window(), Duration::from_secs(5));

        // No mic stream at all
        assert_eq!(monitor.check(&sample(30.0)), Verdict::Healthy);

        meter.record(0.4);
        assert_eq!(monitor.check(&sample(3.0)), Verdict::Healthy);
        assert_eq!(monitor.check(&sample(8.0)), Verdict::Intervene);
        assert_eq!(monitor.check(&sample(8.0)), Verdict::Cooldown);

        tokio::time::advance(Duration::from_secs(16)).await;
        // Mic went quiet more than 5 s ago
        assert_eq!(monitor.check(&sample(8.0)), Verdict::SilentMic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lobby_hop() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push(ScriptedBackend::joined(
            "lobby",
            RoomSnapshot::from([("lobby", &["Alice"][..])]),
        ));
        backend.push(ScriptedBackend::joined(
            "mic2",
            RoomSnapshot::from([("mic2", &["Alice"][..])]),
        ));
        let (mut monitor, meter, events) = monitor(backend.clone());
        let mut rx = events.subscribe();
        meter.record(0.4);

        let started = Instant::now();
        assert_eq!(monitor.handle(&sample(10.0)).await, Verdict::Intervene);
        assert!(started.elapsed() >= Duration::from_millis(900));

        let rooms: Vec<String> = backend.joins.lock().iter().map(|j| j.0.clone()).collect();
        assert_eq!(rooms, vec!["lobby", "mic2"]);
        assert_eq!(monitor.session.read(|s| s.current_room().to_string()), "mic2");

        let mut saw_intervention = false;
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::Intervention { room, .. } = event {
                assert_eq!(room, "mic2");
                saw_intervention = true;
            }
        }
        assert!(saw_intervention);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_hop_from_lobby() {
        let backend = Arc::new(ScriptedBackend::default());
        let (monitor, _, _) = monitor(backend.clone());
        monitor.session.write(|s| s.remember_current_room("lobby"));
        assert_eq!(monitor.intervene().await, None);
        assert!(backend.joins.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_mic_only_warns() {
        let backend = Arc::new(ScriptedBackend::default());
        let (mut monitor, meter, events) = monitor(backend.clone());
        let mut rx = events.subscribe();
        meter.record(0.0);

        assert_eq!(monitor.handle(&sample(10.0)).await, Verdict::SilentMic);
        assert!(backend.joins.lock().is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::RoomMessage { severity: Severity::Warn, .. }
        ));
    }
}
