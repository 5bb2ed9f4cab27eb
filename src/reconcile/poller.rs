//! Status poller
//!
//! `GET /status` every couple of seconds. Besides membership it carries the
//! control lock and what the server knows about us, and it doubles as the
//! heartbeat that keeps our server-side session alive.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::MembershipUpdate;
use crate::api::{Backend, YouInfo};
use crate::control::ControlClient;
use crate::error::Result;
use crate::events::UpdateSource;
use crate::session::SessionHandle;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Result of one successful poll
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSample {
    /// Round trip of the request
    pub latency: Duration,
    pub you: Option<YouInfo>,
    pub received_at: DateTime<Utc>,
}

impl StatusSample {
    /// Seconds since the server last received our audio, `None` if never
    pub fn audio_silence_secs(&self) -> Option<f64> {
        let last_seen = self.you.as_ref()?.audio_last_seen?;
        let now = self.received_at.timestamp_millis() as f64 / 1000.0;
        Some((now - last_seen).max(0.0))
    }
}

pub struct StatusPoller {
    backend: Arc<dyn Backend>,
    session: SessionHandle,
    control: Arc<ControlClient>,
    updates: mpsc::Sender<MembershipUpdate>,
    samples: watch::Sender<Option<StatusSample>>,
    interval: Duration,
    throttler: LogThrottler,
}

impl StatusPoller {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: SessionHandle,
        control: Arc<ControlClient>,
        updates: mpsc::Sender<MembershipUpdate>,
        interval: Duration,
    ) -> Self {
        let (samples, _) = watch::channel(None);
        Self {
            backend,
            session,
            control,
            updates,
            samples,
            interval,
            throttler: LogThrottler::default(),
        }
    }

    /// Latest successful poll, for the metrics reporter and health monitor
    pub fn samples(&self) -> watch::Receiver<Option<StatusSample>> {
        self.samples.subscribe()
    }

    /// Poll once and distribute the result
    pub async fn poll_once(&self) -> Result<StatusSample> {
        let started = Instant::now();
        let report = self.backend.status().await?;
        let latency = started.elapsed();

        if let Some(control) = &report.control {
            self.control.apply_status(control);
        }
        if let Some(you) = &report.you {
            self.session.write(|s| {
                s.set_session_id(you.session_id);
                s.set_last_server_room(you.room.clone());
            });
        }
        if report.rooms.is_some() || report.capacity.is_some() {
            let update = MembershipUpdate {
                source: UpdateSource::Poll,
                rooms: report.rooms,
                capacity: report.capacity,
            };
            if self.updates.send(update).await.is_err() {
                debug!("Reconciler gone, dropping status update");
            }
        }

        let sample = StatusSample {
            latency,
            you: report.you,
            received_at: Utc::now(),
        };
        self.samples.send_replace(Some(sample.clone()));
        Ok(sample)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(_) => {
                    if self.throttler.clear("status_poll") {
                        info!("Status poll recovered");
                    }
                }
                Err(e) => {
                    warn_throttled!(self.throttler, "status_poll", "Status poll failed: {}", e);
                }
            }
        }
        debug!("Status poller stopped");
    }
}
