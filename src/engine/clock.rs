// src/engine/clock.rs

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Marker returned the one time the deadline is observed as reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExpired {
    pub deadline: DateTime<Utc>,
}

/// Exam deadline anchored on the attempt start time.
///
/// Remaining time is always derived from the wall clock passed in, never
/// from a counter, so suspend/resume of the host does not skew it.
#[derive(Debug, Clone)]
pub struct DeadlineClock {
    deadline: DateTime<Utc>,
    fired: bool,
}

impl DeadlineClock {
    /// Durations past chrono's range put the deadline at the latest
    /// representable instant.
    pub fn new(start_time: DateTime<Utc>, duration_seconds: i64) -> Self {
        let deadline = Duration::try_seconds(duration_seconds.max(0))
            .and_then(|duration| start_time.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            deadline,
            fired: false,
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Whole seconds left, rounded up, never negative.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        let millis = (self.deadline - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis + 999) / 1000
        }
    }

    /// True when `now` is already past the deadline (e.g. resuming late).
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Re-evaluates the deadline. Returns `Some` exactly once.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<DeadlineExpired> {
        if self.fired || self.remaining_seconds(now) > 0 {
            return None;
        }
        self.fired = true;
        Some(DeadlineExpired {
            deadline: self.deadline,
        })
    }
}
