//! Time sources. Every "now" read in the engines goes through a [`Clock`] so
//! that tests can pin or step time.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use std::sync::Arc;

/// Length of one exposure notification interval in seconds.
pub const INTERVAL_SECS: i64 = 600;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Number of 10 minute intervals since the unix epoch.
pub fn interval_number(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(INTERVAL_SECS)
}

/// Remaining wall-clock time of the current invocation, as reported by the
/// hosting scheduler.
pub trait RemainingTime: Send + Sync {
    fn remaining(&self) -> TimeDelta;
}

/// Invocation budget measured against a clock from a fixed starting point.
pub struct Deadline {
    clock: Arc<dyn Clock>,
    expires_at: DateTime<Utc>,
}

impl Deadline {
    pub fn new(clock: Arc<dyn Clock>, budget: TimeDelta) -> Self {
        let now = clock.now();
        let expires_at = now
            .checked_add_signed(budget)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Deadline { clock, expires_at }
    }
}

impl RemainingTime for Deadline {
    fn remaining(&self) -> TimeDelta {
        (self.expires_at - self.clock.now()).max(TimeDelta::zero())
    }
}
