//! Time sources.
//!
//! Creation timestamps and `lastPublishedAt` drive the publication-priority
//! order, so every component reads time through a [`Clock`]. Production uses
//! [`SystemClock`]; tests drive a [`ManualClock`] to get a deterministic order.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Wall-clock source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// Every call to [`Clock::now`] returns the current value and then advances
/// it by the configured step, so successive reads are strictly increasing
/// unless the step is zero.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl ManualClock {
    /// Create a clock starting at the Unix epoch plus `start_secs`, advancing one second per read.
    pub fn new(start_secs: i64) -> Self {
        Self::with_step(start_secs, Duration::seconds(1))
    }

    /// Create a clock with an explicit per-read step.
    pub fn with_step(start_secs: i64, step: Duration) -> Self {
        let start = Utc
            .timestamp_opt(start_secs, 0)
            .single()
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
        Self {
            now: Mutex::new(start),
            step,
        }
    }

    /// Create a shared clock.
    pub fn shared(start_secs: i64) -> Arc<Self> {
        Arc::new(Self::new(start_secs))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Read the current value without advancing.
    pub fn peek(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        let current = *now;
        *now += self.step;
        current
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
