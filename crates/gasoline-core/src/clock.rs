//! Time source abstraction.
//!
//! Every time-dependent decision in the bridge (rate windows, disconnect
//! thresholds, query expiry, TTL reads) goes through a [`Clock`] so tests can
//! drive time explicitly instead of sleeping.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Abstraction over time to enable deterministic tests.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant used for all interval math.
    fn now(&self) -> Instant;

    /// Wall-clock time used for timestamps that leave the process.
    fn wall(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock implementation backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// Cloning shares the underlying time, so a clone kept by a test can advance
/// the clock seen by every component it was handed to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl ManualClock {
    /// Start at the current real time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at a fixed wall-clock time.
    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                instant: Instant::now(),
                wall,
            })),
        }
    }

    /// Move both monotonic and wall time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.instant += by;
        state.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Convenience for `advance(Duration::from_millis(ms))`.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Convenience for `advance(Duration::from_secs(secs))`.
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Wrap in a [`SharedClock`].
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.inner.lock() {
            Ok(guard) => guard.instant,
            Err(poisoned) => poisoned.into_inner().instant,
        }
    }

    fn wall(&self) -> DateTime<Utc> {
        match self.inner.lock() {
            Ok(guard) => guard.wall,
            Err(poisoned) => poisoned.into_inner().wall,
        }
    }
}

/// The default shared clock.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Format a wall-clock time as RFC 3339 with second precision and a `Z` suffix.
#[must_use]
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
