//! Log throttling for background loops
//!
//! The poller and the push channel fail every couple of seconds while the
//! server is down. [`LogThrottler`] lets the first failure through, then
//! stays quiet for an interval and reports how many repeats it swallowed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Rate limiter for repeated log messages, keyed by message kind
///
/// # Example
///
/// ```rust
/// use smartmic::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(30));
///
/// assert!(throttler.should_log("status_poll"));
/// assert!(!throttler.should_log("status_poll"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether a message for `key` should be logged now
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but returns how many messages
    /// were swallowed since the last one that got through
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last_logged: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, e.g. once the failing operation recovered
    ///
    /// Returns whether the key was being tracked.
    pub fn clear(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(30)
    }
}

/// Throttled `tracing::warn!`
///
/// Appends the number of swallowed repeats when there were any.
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!("{} ({} similar messages suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}
