//! Microphone level metering

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// RMS of S16 samples, normalised to 0..=1
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

/// Latest microphone level and when the mic was last audibly active
///
/// Written by the capture thread, read by the metrics reporter and the
/// audio health monitor.
#[derive(Debug)]
pub struct LevelMeter {
    /// f32 bits of the last level
    level: AtomicU32,
    /// Frames metered so far
    frames: AtomicU64,
    /// Level at or above which the mic counts as active
    active_threshold: f32,
    last_active: Mutex<Option<Instant>>,
}

impl LevelMeter {
    pub fn new(active_threshold: f32) -> Self {
        Self {
            level: AtomicU32::new(0f32.to_bits()),
            frames: AtomicU64::new(0),
            active_threshold,
            last_active: Mutex::new(None),
        }
    }

    /// Record the level of one captured frame
    pub fn record(&self, level: f32) {
        self.level.store(level.to_bits(), Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
        if level >= self.active_threshold {
            *self.last_active.lock() = Some(Instant::now());
        }
    }

    pub fn record_samples(&self, samples: &[i16]) {
        self.record(rms(samples));
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Whether a microphone stream ever delivered audio
    pub fn has_signal(&self) -> bool {
        self.frames.load(Ordering::Relaxed) > 0
    }

    pub fn last_active(&self) -> Option<Instant> {
        *self.last_active.lock()
    }

    /// Whether the mic was active within `window`
    pub fn active_within(&self, window: Duration) -> bool {
        self.last_active()
            .is_some_and(|at| Instant::now().duration_since(at) <= window)
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(0.02)
    }
}
