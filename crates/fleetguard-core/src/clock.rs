//! Time sources.
//!
//! Circuit timeouts use a monotonic [`Instant`]; usage day keys use wall-clock
//! UTC. Both come from the same [`Clock`] so tests can drive them together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic instant for elapsed-time math
    fn now(&self) -> Instant;

    /// Wall-clock time in UTC
    fn utc_now(&self) -> DateTime<Utc>;

    /// Current UTC calendar day
    fn today(&self) -> NaiveDate {
        self.utc_now().date_naive()
    }
}

/// Real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for simulated time
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the given wall-clock time
    pub fn starting_at(utc: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: utc,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a clock frozen at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Move both time sources forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.base_utc + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }
}
