//! Ingestion rate limiter with a hysteresis circuit breaker.
//!
//! Events are counted in fixed windows (1 s by default). The window is ticked
//! lazily: whichever call first observes that the window has elapsed evaluates
//! it, so there is no timer task and tests drive time through a [`Clock`].
//!
//! State machine:
//!
//! ```text
//! Closed --(streak >= open_streak | memory > hard limit)--> Open
//! Open   --(streak == 0, quiet >= close_after, memory <= close limit)--> Closed
//! ```
//!
//! [`Clock`]: crate::clock::Clock

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{SharedClock, rfc3339};
use crate::config::CircuitConfig;
use crate::error::AdmissionError;
use crate::types::{LifecycleCallback, LifecycleEvent};

pub const REASON_RATE_EXCEEDED: &str = "rate_exceeded";
pub const REASON_MEMORY_EXCEEDED: &str = "memory_exceeded";

#[derive(Debug)]
struct BreakerState {
    window_event_count: u64,
    window_start: Instant,
    streak: u32,
    last_below_threshold_at: Option<Instant>,
    open: bool,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    reason: String,
    memory_bytes: u64,
    simulated_memory: Option<u64>,
}

impl BreakerState {
    fn memory(&self) -> u64 {
        self.simulated_memory.unwrap_or(self.memory_bytes)
    }
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
}

/// Snapshot of the breaker for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitHealth {
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<String>,
    pub current_rate: u64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Full internal state, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitStateKind,
    pub reason: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub window_event_count: u64,
    pub streak: u32,
    pub memory_bytes: u64,
}

/// Body handed to producers whose batch was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResponse {
    pub error: String,
    pub message: String,
    pub retry_after_ms: u64,
    pub circuit_open: bool,
    pub current_rate: u64,
    pub threshold: u64,
}

impl From<&AdmissionError> for RateLimitResponse {
    fn from(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimited {
                retry_after_ms,
                circuit_open,
                current_rate,
                threshold,
            } => Self {
                error: "rate_limited".to_string(),
                message: format!("Server receiving >{threshold} events/sec. Retry after backoff."),
                retry_after_ms: *retry_after_ms,
                circuit_open: *circuit_open,
                current_rate: *current_rate,
                threshold: *threshold,
            },
        }
    }
}

/// Rate-window circuit breaker. Owns its own lock, independent of buffers.
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
    callback: Mutex<Option<LifecycleCallback>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState {
                window_event_count: 0,
                window_start: now,
                streak: 0,
                last_below_threshold_at: Some(now),
                open: false,
                opened_at: None,
                opened_at_wall: None,
                reason: String::new(),
                memory_bytes: 0,
                simulated_memory: None,
            }),
            callback: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Install (or clear) the open/close notification hook.
    pub fn set_lifecycle_callback(&self, callback: Option<LifecycleCallback>) {
        let mut slot = match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = callback;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: Option<LifecycleEvent>) {
        let Some(event) = event else { return };
        let callback = match self.callback.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// Count `n` events into the current window.
    pub fn record_events(&self, n: u64) {
        let event = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let event = self.roll_window(&mut state, now);
            state.window_event_count = state.window_event_count.saturating_add(n);
            event
        };
        self.emit(event);
    }

    /// True when ingestion must be rejected.
    pub fn check_rate_limit(&self) -> bool {
        let (rejected, event) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let event = self.roll_window(&mut state, now);
            let rejected = state.open
                || state.window_event_count > self.config.rate_threshold
                || state.memory() > self.config.memory_hard_limit;
            (rejected, event)
        };
        self.emit(event);
        rejected
    }

    /// [`check_rate_limit`](Self::check_rate_limit) as a typed rejection.
    pub fn admission(&self) -> Result<(), AdmissionError> {
        if !self.check_rate_limit() {
            return Ok(());
        }
        let state = self.lock_state();
        Err(AdmissionError::RateLimited {
            retry_after_ms: self.config.retry_after_ms,
            circuit_open: state.open,
            current_rate: state.window_event_count,
            threshold: self.config.rate_threshold,
        })
    }

    /// Open the circuit unconditionally.
    pub fn force_open(&self, reason: &str) {
        let event = {
            let mut state = self.lock_state();
            if state.open {
                state.reason = reason.to_string();
                None
            } else {
                Some(self.open_locked(&mut state, reason))
            }
        };
        self.emit(event);
    }

    /// Latest total buffered memory, as measured by the owner of the buffers.
    pub fn set_memory_bytes(&self, bytes: u64) {
        let event = {
            let mut state = self.lock_state();
            state.memory_bytes = bytes;
            self.evaluate(&mut state)
        };
        self.emit(event);
    }

    /// Override the memory signal (None restores the measured value).
    pub fn simulate_memory(&self, bytes: Option<u64>) {
        let event = {
            let mut state = self.lock_state();
            state.simulated_memory = bytes;
            self.evaluate(&mut state)
        };
        self.emit(event);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock_state().open
    }

    #[must_use]
    pub fn health(&self) -> CircuitHealth {
        let state = self.lock_state();
        CircuitHealth {
            circuit_open: state.open,
            opened_at: if state.open {
                state.opened_at_wall.map(rfc3339)
            } else {
                None
            },
            current_rate: state.window_event_count,
            memory_bytes: state.memory(),
            reason: state.reason.clone(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock_state();
        CircuitSnapshot {
            state: if state.open {
                CircuitStateKind::Open
            } else {
                CircuitStateKind::Closed
            },
            reason: state.reason.clone(),
            opened_at: if state.open { state.opened_at_wall } else { None },
            window_event_count: state.window_event_count,
            streak: state.streak,
            memory_bytes: state.memory(),
        }
    }

    /// Response body for a rejected producer, reflecting current state.
    #[must_use]
    pub fn rate_limit_response(&self) -> RateLimitResponse {
        let state = self.lock_state();
        let err = AdmissionError::RateLimited {
            retry_after_ms: self.config.retry_after_ms,
            circuit_open: state.open,
            current_rate: state.window_event_count,
            threshold: self.config.rate_threshold,
        };
        RateLimitResponse::from(&err)
    }

    // -------------------------------------------------------------------------
    // Window evaluation (caller holds the state lock)
    // -------------------------------------------------------------------------

    fn roll_window(&self, state: &mut BreakerState, now: Instant) -> Option<LifecycleEvent> {
        if now.saturating_duration_since(state.window_start) <= self.config.window() {
            return None;
        }
        let event = self.tick(state, now);
        state.window_event_count = 0;
        state.window_start = now;
        event
    }

    /// One evaluation per elapsed window.
    fn tick(&self, state: &mut BreakerState, now: Instant) -> Option<LifecycleEvent> {
        if state.window_event_count > self.config.rate_threshold {
            state.streak = state.streak.saturating_add(1);
            state.last_below_threshold_at = None;
        } else {
            state.streak = 0;
            if state.last_below_threshold_at.is_none() {
                state.last_below_threshold_at = Some(now);
            }
        }
        self.evaluate(state)
    }

    fn evaluate(&self, state: &mut BreakerState) -> Option<LifecycleEvent> {
        let now = self.clock.now();
        if !state.open {
            if state.streak >= self.config.open_streak {
                return Some(self.open_locked(state, REASON_RATE_EXCEEDED));
            }
            if state.memory() > self.config.memory_hard_limit {
                return Some(self.open_locked(state, REASON_MEMORY_EXCEEDED));
            }
            return None;
        }

        if state.streak > 0 {
            return None;
        }
        let Some(below_since) = state.last_below_threshold_at else {
            return None;
        };
        if now.saturating_duration_since(below_since) < self.config.close_after() {
            return None;
        }
        if state.memory() > self.config.memory_close_limit {
            return None;
        }

        let open_duration = state
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        let previous_reason = std::mem::take(&mut state.reason);
        state.open = false;
        state.opened_at = None;
        state.opened_at_wall = None;
        state.streak = 0;
        info!(
            reason = %previous_reason,
            rate = state.window_event_count,
            open_secs = open_duration.as_secs_f64(),
            "Ingestion circuit closed"
        );
        Some(LifecycleEvent::CircuitClosed {
            previous_reason,
            open_duration_secs: open_duration.as_secs_f64(),
            rate: state.window_event_count,
        })
    }

    fn open_locked(&self, state: &mut BreakerState, reason: &str) -> LifecycleEvent {
        state.open = true;
        state.opened_at = Some(self.clock.now());
        state.opened_at_wall = Some(self.clock.wall());
        state.reason = reason.to_string();
        // Recovery is measured from the next quiet window, never from before the open.
        state.last_below_threshold_at = None;
        warn!(
            reason,
            streak = state.streak,
            rate = state.window_event_count,
            memory_bytes = state.memory(),
            threshold = self.config.rate_threshold,
            "Ingestion circuit opened"
        );
        LifecycleEvent::CircuitOpened {
            reason: reason.to_string(),
            streak: state.streak,
            rate: state.window_event_count,
            threshold: self.config.rate_threshold,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.snapshot().state)
            .finish_non_exhaustive()
    }
}
