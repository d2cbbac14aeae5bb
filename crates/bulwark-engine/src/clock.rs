//! Wall-clock and monotonic time.
//!
//! Timestamps on records and snapshots come from `now`; slice budgets are
//! measured with `elapsed`, which never goes backwards.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((start, Duration::ZERO)),
        }
    }

    /// Move both wall-clock and monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        if let Ok(delta) = chrono::Duration::from_std(by) {
            inner.0 += delta;
        }
        inner.1 += by;
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().0
    }

    fn elapsed(&self) -> Duration {
        self.inner.lock().1
    }
}
