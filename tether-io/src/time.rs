//! Time utilities for Tether
//!
//! Connections never read the system clock directly; they ask a [`Clock`].
//! Production code uses [`SystemClock`], tests use [`ManualClock`] and step
//! time forward explicitly.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Timer for periodic operations
///
/// Used for punch-through probe spacing and periodic statistics. The caller
/// supplies the current instant so the timer works with any [`Clock`].
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer whose first period starts at `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    /// Create a timer that is already expired
    pub fn expired_at(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now.checked_sub(interval).unwrap_or(now),
        }
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self, now: Instant) {
        self.last_fire = now;
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_fire))
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}
