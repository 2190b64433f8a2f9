//! telemetry-breaker: per-backend circuit breaker + bounded retry (§4.7).
//!
//! One [`CircuitBreaker`] guards one backend. [`CircuitBreaker::call`] is the
//! single entry point: it admits (or short-circuits) the call, retries
//! retryable failures with exponential backoff, and folds the outcome back
//! into the breaker's state. Time is expressed in `tokio::time::Instant` so
//! tests can drive the state machine deterministically with
//! `#[tokio::test(start_paused = true)]` rather than real sleeps.

use std::future::Future;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables for one breaker instance (§4.7 defaults).
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before tripping to `Open`.
    pub failure_threshold: u32,
    /// Initial cool-down before a probe is admitted.
    pub cooldown: Duration,
    /// Cool-down ceiling after repeated re-openings.
    pub cooldown_max: Duration,
    /// Max attempts per call while `Closed` (1 = no retry).
    pub retry_attempts: u32,
    /// First retry backoff.
    pub retry_base: Duration,
    /// Retry backoff ceiling.
    pub retry_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(5 * 60),
            retry_attempts: 3,
            retry_base: Duration::from_millis(200),
            retry_cap: Duration::from_secs(5),
        }
    }
}

/// Public breaker state, exposed for `backend_circuit_state{backend}` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    /// Current cool-down window; grows on repeated re-openings, resets on
    /// a successful close.
    cooldown: Duration,
    opened_at: Option<Instant>,
    /// At most one probe may be in flight while `HalfOpen`.
    probe_in_flight: bool,
}

/// Outcome of a call rejected or exhausted by the breaker.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker was `Open` (or a probe was already in flight); the
    /// backend was never contacted.
    Open,
    /// The backend was called and every retryable attempt failed, or a
    /// non-retryable error was returned.
    Backend(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit breaker open"),
            BreakerError::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

/// A per-backend circuit breaker with an embedded bounded-retry policy.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                cooldown,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, reflecting cool-down expiry as of `now` without
    /// mutating anything (used for metrics and tests).
    pub async fn state(&self) -> BreakerState {
        let inner = self.inner.lock().await;
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at))
                if Instant::now().saturating_duration_since(opened_at) >= inner.cooldown =>
            {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Run `op`, admitting it through the breaker and retrying retryable
    /// failures. `is_retryable` classifies each error from `op`.
    pub async fn call<F, Fut, T, E>(
        &self,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted_as_probe = match self.admit().await {
            Admission::Rejected => return Err(BreakerError::Open),
            Admission::Closed => false,
            Admission::Probe => true,
        };

        // A half-open probe gets exactly one attempt; `Closed` gets the
        // full retry budget.
        let max_attempts = if admitted_as_probe {
            1
        } else {
            self.config.retry_attempts.max(1)
        };

        let mut last_err = None;
        for attempt in 0..max_attempts {
            match op().await {
                Ok(value) => {
                    self.record_success(admitted_as_probe).await;
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = is_retryable(&e);
                    last_err = Some(e);
                    if !retryable || attempt + 1 >= max_attempts {
                        break;
                    }
                    let backoff = self.retry_backoff(attempt);
                    debug!(backend = %self.name, attempt, ?backoff, "retrying backend call");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        self.record_failure(admitted_as_probe).await;
        Err(BreakerError::Backend(last_err.expect("loop ran at least once")))
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let scaled = self.config.retry_base.saturating_mul(1 << attempt.min(16));
        scaled.min(self.config.retry_cap)
    }

    async fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Admission::Closed,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| Instant::now().saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed >= inner.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    async fn record_success(&self, was_probe: bool) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        inner.cooldown = self.config.cooldown;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        if was_probe || inner.state != BreakerState::Closed {
            debug!(backend = %self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
    }

    async fn record_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock().await;
        inner.probe_in_flight = false;
        if was_probe {
            inner.cooldown = (inner.cooldown * 2).min(self.config.cooldown_max);
            inner.opened_at = Some(Instant::now());
            inner.state = BreakerState::Open;
            warn!(backend = %self.name, cooldown = ?inner.cooldown, "probe failed, reopening circuit");
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(backend = %self.name, cooldown = ?inner.cooldown, "circuit breaker opened");
        }
    }
}

enum Admission {
    Closed,
    Probe,
    Rejected,
}
