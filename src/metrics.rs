//! Client metrics reporter
//!
//! Sends the last status round trip and the current microphone level to
//! `POST /client/metrics` so the mixer's operator view can show them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{Backend, ClientMetrics};
use crate::media::LevelMeter;
use crate::reconcile::poller::StatusSample;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Minimum spacing between two reports
const MIN_GAP: Duration = Duration::from_millis(900);

pub struct MetricsReporter {
    backend: Arc<dyn Backend>,
    meter: Arc<LevelMeter>,
    samples: watch::Receiver<Option<StatusSample>>,
    interval: Duration,
    last_sent: Option<Instant>,
    throttler: LogThrottler,
}

impl MetricsReporter {
    pub fn new(
        backend: Arc<dyn Backend>,
        meter: Arc<LevelMeter>,
        samples: watch::Receiver<Option<StatusSample>>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            meter,
            samples,
            interval,
            last_sent: None,
            throttler: LogThrottler::default(),
        }
    }

    /// Current values, `None` until the microphone produced audio
    pub fn collect(&self) -> Option<ClientMetrics> {
        if !self.meter.has_signal() {
            return None;
        }
        let latency_ms = self
            .samples
            .borrow()
            .as_ref()
            .map(|s| s.latency.as_millis() as u64);
        Some(ClientMetrics {
            latency_ms,
            audio_level: Some(self.meter.level()),
        })
    }

    /// Send one report; false if skipped
    pub async fn report_once(&mut self) -> bool {
        let now = Instant::now();
        if self
            .last_sent
            .is_some_and(|at| now.duration_since(at) < MIN_GAP)
        {
            return false;
        }
        let Some(metrics) = self.collect() else {
            return false;
        };
        self.last_sent = Some(now);

        if let Err(e) = self.backend.report_metrics(&metrics).await {
            warn_throttled!(self.throttler, "metrics", "Failed to report metrics: {}", e);
        }
        true
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.report_once().await;
        }
        debug!("Metrics reporter stopped");
    }
}
