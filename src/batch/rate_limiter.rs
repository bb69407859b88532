//! Sliding-window self-throttle for outbound CRM calls.

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Tracks call timestamps over a trailing window and sleeps callers
/// that would exceed the ceiling. The sleep happens with the lock
/// released, so waiting for a slot never blocks other tasks from
/// recording theirs.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    config: RateLimitConfig,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            config,
        }
    }

    /// Claim a call slot, sleeping until one frees up if the window is
    /// full. Returns the total time spent waiting, `Duration::ZERO`
    /// when a slot was free immediately.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let sleep_for = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = timestamps.front() {
                    if now.duration_since(oldest) >= self.config.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if timestamps.len() < self.config.max_requests {
                    timestamps.push_back(now);
                    return waited;
                }
                // Oldest entry ages out first; add a small margin so we
                // do not wake up just barely inside the window.
                let oldest = timestamps[0];
                self.config.window - now.duration_since(oldest) + self.config.margin
            };
            debug!(sleep_ms = sleep_for.as_millis() as u64, "rate limit window full");
            tokio::time::sleep(sleep_for).await;
            waited += sleep_for;
        }
    }

    /// Slots currently free in the window.
    pub async fn available(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) >= self.config.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        self.config.max_requests.saturating_sub(timestamps.len())
    }
}
