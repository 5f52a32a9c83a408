//! Global rate limiting for exchange calls.
//!
//! Sliding-window token bucket shared by every worker. The provider
//! limit applies to the whole account, so there is exactly one limiter
//! per process, owned by the metered wrapper.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sliding-window token bucket.
pub struct RateLimiter {
    /// Maximum calls per window.
    max_calls: u32,
    /// Window size.
    window: Duration,
    /// Timestamps of recent calls.
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_calls` per `window_secs` seconds.
    pub fn new(max_calls: u32, window_secs: u64) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(window_secs),
            timestamps: Mutex::new(VecDeque::with_capacity(max_calls as usize)),
        }
    }

    /// Limiter at the Bybit spot default: 10 calls per second.
    pub fn provider_default() -> Self {
        Self::new(10, 1)
    }

    /// Check whether a call can go out right now.
    pub fn can_send(&self) -> bool {
        let mut timestamps = self.timestamps.lock();
        Self::evict(&mut timestamps, self.window);
        timestamps.len() < self.max_calls as usize
    }

    /// Record an outgoing call.
    pub fn record_send(&self) {
        let mut timestamps = self.timestamps.lock();
        Self::evict(&mut timestamps, self.window);
        timestamps.push_back(Instant::now());

        if timestamps.len() >= self.max_calls as usize {
            warn!(
                count = timestamps.len(),
                max = self.max_calls,
                "Exchange rate limit reached"
            );
        }
    }

    /// Current number of calls inside the window.
    pub fn current_count(&self) -> u32 {
        let mut timestamps = self.timestamps.lock();
        Self::evict(&mut timestamps, self.window);
        timestamps.len() as u32
    }

    /// Remaining capacity inside the window.
    pub fn remaining_capacity(&self) -> u32 {
        self.max_calls.saturating_sub(self.current_count())
    }

    /// Wait until a call slot is available, then claim it.
    ///
    /// Claiming inside the same lock acquisition keeps concurrent
    /// waiters from overshooting the window.
    pub async fn acquire(&self) {
        loop {
            {
                let mut timestamps = self.timestamps.lock();
                Self::evict(&mut timestamps, self.window);
                if timestamps.len() < self.max_calls as usize {
                    timestamps.push_back(Instant::now());
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn evict(timestamps: &mut VecDeque<Instant>, window: Duration) {
        let cutoff = Instant::now() - window;
        while timestamps.front().is_some_and(|&t| t < cutoff) {
            timestamps.pop_front();
        }
    }

    /// Clear all recorded calls.
    pub fn reset(&self) {
        self.timestamps.lock().clear();
    }
}
