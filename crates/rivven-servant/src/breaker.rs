//! Per-server circuit breaker
//!
//! # States
//!
//! - **Closed**: calls pass through; outcomes are kept in a sliding window
//! - **Open**: calls fail with [`Error::BreakerOpen`] without touching the server
//! - **Half-Open**: a single trial call decides between closed and open
//!
//! The breaker trips once the window holds at least `min_calls` outcomes and
//! the failure ratio reaches `failure_rate_threshold`. After `cooldown` the
//! next permit request moves it to half-open.
//!
//! Only server faults count as failures (see [`Error::is_server_fault`]).
//!
//! ```rust,ignore
//! let permit = breaker.try_acquire()?;
//! let result = conn.query(sql, &args).await;
//! permit.record(&result);
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::metrics::ServantMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests fail immediately
    Open,
    /// Testing if the server has recovered
    HalfOpen,
}

impl CircuitState {
    /// Lower-case state name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `(recorded_at, failed)`, oldest first
    outcomes: VecDeque<(Instant, bool)>,
    last_transition: Instant,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one server
#[derive(Debug)]
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `server`
    pub fn new(server: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    /// Server this breaker guards
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission to call the server.
    ///
    /// Fails with [`Error::BreakerOpen`] while open, or while half-open with
    /// the trial call already taken.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if inner.last_transition.elapsed() < self.config.cooldown {
                    return Err(self.open_error());
                }
                self.transition_to(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a failure observed outside a permitted call (failed heartbeat)
    pub fn record_failure(&self) {
        self.on_outcome(false, true);
    }

    /// Outcomes and failures currently inside the window
    pub fn window_counts(&self) -> (usize, usize) {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        let failures = inner.outcomes.iter().filter(|(_, failed)| *failed).count();
        (inner.outcomes.len(), failures)
    }

    fn open_error(&self) -> Error {
        Error::BreakerOpen {
            server: self.server.clone(),
        }
    }

    fn on_outcome(&self, trial: bool, failed: bool) {
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if failed {
                self.transition_to(&mut inner, CircuitState::Open);
            } else {
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            return;
        }

        // Late outcomes of calls admitted before the breaker tripped.
        if inner.state != CircuitState::Closed {
            return;
        }

        let now = Instant::now();
        inner.outcomes.push_back((now, failed));
        self.prune(&mut inner, now);

        let calls = inner.outcomes.len();
        if calls < self.config.min_calls as usize {
            return;
        }
        let failures = inner.outcomes.iter().filter(|(_, failed)| *failed).count();
        if failures as f64 / calls as f64 >= self.config.failure_rate_threshold {
            self.transition_to(&mut inner, CircuitState::Open);
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        let window = self.config.window;
        while let Some((at, _)) = inner.outcomes.front() {
            if now.saturating_duration_since(*at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        inner.state = new_state;
        inner.last_transition = Instant::now();
        match new_state {
            CircuitState::Closed => {
                inner.outcomes.clear();
                tracing::info!(server = %self.server, from = %old_state, "circuit breaker closed");
            }
            CircuitState::Open => {
                tracing::warn!(
                    server = %self.server,
                    from = %old_state,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(server = %self.server, "circuit breaker half-open, allowing trial call");
            }
        }
        ServantMetrics::increment_breaker_transitions(&self.server, new_state);
    }
}

/// Permission to make one call.
///
/// Settle it with [`record`](Self::record), [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unsettled permit records nothing
/// and frees the half-open trial slot.
#[must_use = "a permit should be settled with the call outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this is the half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the call outcome; only server faults count as failures
    pub fn record<T>(self, result: &Result<T>) {
        let failed = matches!(result, Err(e) if e.is_server_fault());
        self.settle(failed);
    }

    /// Record a success
    pub fn success(self) {
        self.settle(false);
    }

    /// Record a failure
    pub fn failure(self) {
        self.settle(true);
    }

    fn settle(mut self, failed: bool) {
        self.settled = true;
        self.breaker.on_outcome(self.trial, failed);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

impl fmt::Debug for BreakerPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("server", &self.breaker.server)
            .field("trial", &self.trial)
            .finish()
    }
}
