use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Published API ceilings and the fraction of each held back as headroom.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_day: u32,
    pub safety_margin: f64,
}

impl RateLimits {
    pub fn effective_per_minute(&self) -> usize {
        self.effective(self.per_minute)
    }

    pub fn effective_per_day(&self) -> usize {
        self.effective(self.per_day)
    }

    fn effective(&self, ceiling: u32) -> usize {
        (f64::from(ceiling) * (1.0 - self.safety_margin)).floor() as usize
    }
}

/// Sliding-window limiter over the trailing minute and day.
///
/// The limiter never sleeps. `before_call` reports how long the caller has
/// to wait and `record_call` registers an issued call, both at an explicit
/// instant.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    // Ascending; holds every call within the trailing day.
    window: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            window: VecDeque::new(),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Wait required before a call at `now` stays within both ceilings.
    /// Zero means the call may be issued immediately.
    pub fn before_call(&self, now: Instant) -> Duration {
        let minute_wait = self.horizon_wait(now, MINUTE, self.limits.effective_per_minute());
        let day_wait = self.horizon_wait(now, DAY, self.limits.effective_per_day());
        minute_wait.max(day_wait)
    }

    pub fn record_call(&mut self, at: Instant) {
        let pos = self.window.partition_point(|t| *t <= at);
        self.window.insert(pos, at);
        self.evict(at);
    }

    /// Calls recorded within `horizon` of `now`.
    pub fn calls_within(&self, now: Instant, horizon: Duration) -> usize {
        self.window.len() - self.first_inside(now, horizon)
    }

    fn horizon_wait(&self, now: Instant, horizon: Duration, ceiling: usize) -> Duration {
        let start = self.first_inside(now, horizon);
        let inside = self.window.len() - start;
        if inside < ceiling {
            return Duration::ZERO;
        }
        // Once this call leaves the window, fewer than `ceiling` remain.
        let Some(blocking) = self.window.get(start + inside - ceiling) else {
            return horizon;
        };
        horizon.saturating_sub(now.saturating_duration_since(*blocking))
    }

    fn first_inside(&self, now: Instant, horizon: Duration) -> usize {
        self.window
            .partition_point(|t| now.saturating_duration_since(*t) >= horizon)
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) >= DAY {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
