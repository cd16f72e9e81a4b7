//! Circuit breaker guarding the upstream market-data API.
//!
//! One breaker protects one upstream failure domain and is shared by all
//! scan workers.
//!
//! ```text
//! ┌─────────┐  threshold failures   ┌────────┐
//! │ CLOSED  │ ─────────────────────▶│  OPEN  │◀──────────┐
//! │(normal) │    within window      │(fast   │           │
//! └─────────┘                       │ fail)  │           │ trial failed
//!      ▲                            └────────┘           │ (cooldown x2)
//!      │                                 │ cooldown      │
//!      │        trial succeeded          ▼ elapsed       │
//!      │                           ┌───────────┐         │
//!      └───────────────────────────│ HALF_OPEN │─────────┘
//!                                  │ (1 trial) │
//!                                  └───────────┘
//! ```
//!
//! Callers obtain a [`CallPermit`] before each upstream attempt and settle
//! it with `success()` or `failure()`. A permit dropped unsettled (e.g. the
//! worker was cancelled) leaves the breaker state untouched and frees the
//! half-open trial slot.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, trace, warn};

// ---------------------------------------------------------------------------
// State & configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast until the cooldown deadline.
    Open,
    /// A single trial call is allowed.
    HalfOpen,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_secs` that trip the breaker.
    pub failure_threshold: u32,
    pub window_secs: u64,
    /// Open period after the first trip.
    pub cooldown_secs: u64,
    /// Upper bound for the doubled cooldown on repeated trips.
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
            max_cooldown_secs: 300,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn window_secs(mut self, secs: u64) -> Self {
        self.window_secs = secs;
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn max_cooldown_secs(mut self, secs: u64) -> Self {
        self.max_cooldown_secs = secs;
        self
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Cooldown for the n-th consecutive trip (1-based).
    fn cooldown_for(&self, trips: u32) -> Duration {
        let doublings = trips.saturating_sub(1).min(16);
        Duration::from_secs(self.cooldown_secs)
            .saturating_mul(1u32 << doublings)
            .min(Duration::from_secs(self.max_cooldown_secs.max(self.cooldown_secs)))
    }
}

/// Returned instead of calling upstream while the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{name}' is open (retry in {retry_in:?})")]
pub struct CircuitOpenError {
    pub name: String,
    /// Time until the next trial may be attempted. Zero while another
    /// trial is already in flight.
    pub retry_in: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    /// Consecutive trips without a successful trial.
    pub trips: u32,
    pub last_failure: Option<Instant>,
    pub open_until: Option<Instant>,
}

struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    open_until: Option<Instant>,
    trips: u32,
    trial_in_flight: bool,
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_failure: None,
                open_until: None,
                trips: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the Open → HalfOpen transition if due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Ask permission for one upstream call.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                info!(circuit = %self.name, "Circuit breaker HALF_OPEN, sending trial call");
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => Err(CircuitOpenError {
                name: self.name.clone(),
                retry_in: Duration::ZERO,
            }),
            CircuitState::Open => Err(CircuitOpenError {
                name: self.name.clone(),
                retry_in: inner
                    .open_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default(),
            }),
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        self.prune(&mut inner, now);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures_in_window: inner.failures.len(),
            trips: inner.trips,
            last_failure: inner.last_failure,
            open_until: inner.open_until,
        }
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::close(&mut inner);
        info!(circuit = %self.name, "Circuit breaker manually reset");
    }

    // -- transitions ------------------------------------------------------

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial && inner.state == CircuitState::HalfOpen {
            Self::close(&mut inner);
            info!(circuit = %self.name, "Trial succeeded, circuit breaker CLOSED");
        }
        trace!(circuit = %self.name, state = ?inner.state, "Circuit breaker recorded success");
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.trips = 1;
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.trips = inner.trips.saturating_add(1);
                self.open(&mut inner, now);
            }
            // Late results from calls admitted before the trip.
            _ => {}
        }

        trace!(
            circuit = %self.name,
            state = ?inner.state,
            failures = inner.failures.len(),
            "Circuit breaker recorded failure"
        );
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(until) = inner.open_until {
                if now >= until {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = false;
                }
            }
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        let window = self.config.window();
        while let Some(first) = inner.failures.front() {
            if now.saturating_duration_since(*first) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        let cooldown = self.config.cooldown_for(inner.trips);
        inner.state = CircuitState::Open;
        inner.open_until = Some(now + cooldown);
        inner.trial_in_flight = false;
        inner.failures.clear();
        warn!(
            circuit = %self.name,
            trips = inner.trips,
            cooldown_secs = cooldown.as_secs(),
            "Circuit breaker OPENED"
        );
    }

    fn close(inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.open_until = None;
        inner.trips = 0;
        inner.trial_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// Call permit
// ---------------------------------------------------------------------------

/// Admission for a single upstream call. Settle it with the call outcome.
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
