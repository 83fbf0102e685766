//! Outbound message-rate self-protection.
//!
//! Every outbound send is recorded in a sliding window; crossing the lower
//! threshold is a recoverable warning, crossing the upper one tells the caller
//! to terminate the process. The crash threshold is a safety valve against
//! infinite-loop bugs elsewhere in the application, not a normal error path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::time::interval;

use crate::config::Config;

/// How often the background task prunes the window during idle periods.
const IDLE_PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// Verdict for a single outbound send.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Below the warn threshold
    Normal,
    /// Above the warn threshold; caller logs and continues
    Warn,
    /// At or above the crash threshold; caller must terminate the process
    Fatal,
}

/// Sliding-window counter over outbound message timestamps.
///
/// Purely observational: the guard never inspects message content and never
/// enforces consequences itself.
pub struct TrafficGuard {
    window: Mutex<VecDeque<Instant>>,
    interval: Duration,
    warn_threshold: usize,
    crash_threshold: usize,
}

impl TrafficGuard {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            interval: config.rate_interval,
            warn_threshold: config.warn_per_second,
            crash_threshold: config.crash_per_second,
        }
    }

    /// Record one outbound send and classify the current rate.
    ///
    /// Appends `now` to the window, prunes entries older than one rate
    /// interval, then compares the window length against the thresholds.
    pub fn record_and_check(&self) -> Level {
        let now = Instant::now();
        // A poisoned lock leaves only a VecDeque of timestamps behind, which
        // has no inconsistent intermediate state.
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        window.push_back(now);
        Self::prune_window(&mut window, now, self.interval);

        if window.len() >= self.crash_threshold {
            Level::Fatal
        } else if window.len() > self.warn_threshold {
            Level::Warn
        } else {
            Level::Normal
        }
    }

    /// Drop timestamps that have fallen out of the rate window.
    pub fn prune(&self) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_window(&mut window, Instant::now(), self.interval);
    }

    /// Number of sends currently inside the window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn prune_window(window: &mut VecDeque<Instant>, now: Instant, interval: Duration) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > interval {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Start the background task that prunes the window every few seconds so
    /// it cannot grow unbounded while the connection is idle.
    pub fn start_prune_task(self: &Arc<Self>) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut tick = interval(IDLE_PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                if Arc::strong_count(&this) == 1 {
                    // Only the prune task holds the guard; nothing sends anymore
                    break;
                }
                this.prune();
            }
        });
    }
}
