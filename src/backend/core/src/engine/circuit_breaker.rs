//! Circuit breaker guarding storage calls.
//!
//! Prevents a failing store from being hammered by every worker and the
//! scheduler: after enough consecutive failures calls are refused until a
//! retry timeout passes, then a probe phase decides whether to close again.
//!
//! The state is an immutable value behind a shared slot. Transitions are
//! computed outside the lock and installed only if the slot still holds the
//! snapshot they were computed from; a writer that lost the race drops its
//! update.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{add_duration, SharedClock};
use crate::error::{EngineError, Result};
use crate::telemetry::{BreakerGaugeState, BreakerMetrics};

/// Circuit breaker states, without their data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Too many failures - calls refused
    Open,
    /// Probing whether the dependency recovered - calls allowed
    HalfOpen,
}

/// Breaker state with its per-state data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { last_failed_at: DateTime<Utc> },
    HalfOpen { successes: u32 },
}

impl BreakerState {
    pub fn kind(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::Closed { failures: 0 }
    }
}

/// Input to the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    Failure { at: DateTime<Utc> },
    /// Availability check at `now`
    Probe { now: DateTime<Utc> },
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive half-open successes needed to close
    pub max_success_count: u32,
    /// Consecutive closed failures needed to open
    pub max_failure_count: u32,
    /// How long an open breaker refuses calls
    pub retry_timeout: Duration,
}

impl BreakerSettings {
    /// All three values must be positive.
    pub fn new(max_success_count: u32, max_failure_count: u32, retry_timeout: Duration) -> Result<Self> {
        if max_success_count == 0 || max_failure_count == 0 {
            return Err(EngineError::configuration(
                "Circuit breaker success and failure counts must be greater than zero",
            ));
        }
        if retry_timeout.is_zero() {
            return Err(EngineError::configuration(
                "Circuit breaker retry timeout must be greater than zero",
            ));
        }
        Ok(Self {
            max_success_count,
            max_failure_count,
            retry_timeout,
        })
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_success_count: 3,
            max_failure_count: 5,
            retry_timeout: Duration::from_secs(30),
        }
    }
}

/// Pure transition function.
pub fn transition(state: &BreakerState, event: BreakerEvent, settings: &BreakerSettings) -> BreakerState {
    match (state, event) {
        (BreakerState::Closed { .. }, BreakerEvent::Success) => BreakerState::Closed { failures: 0 },
        (BreakerState::Closed { failures }, BreakerEvent::Failure { at }) => {
            let failures = failures.saturating_add(1);
            if failures >= settings.max_failure_count {
                BreakerState::Open { last_failed_at: at }
            } else {
                BreakerState::Closed { failures }
            }
        }
        (BreakerState::Open { last_failed_at }, BreakerEvent::Probe { now }) => {
            if now > add_duration(*last_failed_at, settings.retry_timeout) {
                BreakerState::HalfOpen { successes: 0 }
            } else {
                state.clone()
            }
        }
        (BreakerState::HalfOpen { successes }, BreakerEvent::Success) => {
            let successes = successes.saturating_add(1);
            if successes >= settings.max_success_count {
                BreakerState::Closed { failures: 0 }
            } else {
                BreakerState::HalfOpen { successes }
            }
        }
        (BreakerState::HalfOpen { .. }, BreakerEvent::Failure { at }) => {
            BreakerState::Open { last_failed_at: at }
        }
        // Open ignores outcomes; closed and half-open pass probes unchanged.
        (_, _) => state.clone(),
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

/// Shared breaker handle.
pub type SharedBreaker = Arc<CircuitBreaker>;

/// Circuit breaker for a single dependency.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    clock: SharedClock,
    state: Mutex<Arc<BreakerState>>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("state", &self.current())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            state: Mutex::new(Arc::new(BreakerState::default())),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state value.
    pub fn current(&self) -> BreakerState {
        (**self.state.lock()).clone()
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().kind()
    }

    pub fn is_state(&self, kind: CircuitState) -> bool {
        self.state() == kind
    }

    /// Whether calls should be attempted now.
    ///
    /// On an open breaker whose retry timeout has passed this moves the
    /// breaker to half-open and lets the caller through as a probe.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        self.update(BreakerEvent::Probe { now }).kind() != CircuitState::Open
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.update(BreakerEvent::Success);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let at = self.clock.now();
        self.update(BreakerEvent::Failure { at });
    }

    /// Run `supplier` and report its outcome to the breaker.
    ///
    /// Does not check availability; use [`call`](Self::call) for that.
    pub async fn apply<T, F, Fut>(&self, supplier: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match supplier().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Run `supplier` if the breaker is available, otherwise fail with
    /// `CircuitOpen` without calling it.
    pub async fn call<T, F, Fut>(&self, supplier: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_available() {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::circuit_open().with_context("breaker", &self.name));
        }
        self.apply(supplier).await
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    /// Compute the next state from a snapshot and install it if the
    /// snapshot is still current. Returns the state in effect afterwards.
    fn update(&self, event: BreakerEvent) -> Arc<BreakerState> {
        let snapshot = self.state.lock().clone();
        let next = transition(&snapshot, event, &self.settings);
        if next == *snapshot {
            return snapshot;
        }

        let next = Arc::new(next);
        {
            let mut slot = self.state.lock();
            if !Arc::ptr_eq(&slot, &snapshot) {
                return slot.clone();
            }
            *slot = next.clone();
        }

        if snapshot.kind() != next.kind() {
            self.log_transition(&snapshot, &next);
        }
        next
    }

    fn log_transition(&self, from: &BreakerState, to: &BreakerState) {
        let gauge = match to.kind() {
            CircuitState::Closed => BreakerGaugeState::Closed,
            CircuitState::HalfOpen => BreakerGaugeState::HalfOpen,
            CircuitState::Open => BreakerGaugeState::Open,
        };
        BreakerMetrics::record_transition(gauge);

        match to {
            BreakerState::Open { last_failed_at } => tracing::warn!(
                breaker = %self.name,
                from = ?from.kind(),
                last_failed_at = %last_failed_at,
                retry_timeout = ?self.settings.retry_timeout,
                "Circuit breaker opened"
            ),
            BreakerState::HalfOpen { .. } => tracing::info!(
                breaker = %self.name,
                "Circuit breaker transitioning to half-open"
            ),
            BreakerState::Closed { .. } => tracing::info!(
                breaker = %self.name,
                "Circuit breaker closed after successful recovery"
            ),
        }
    }
}
