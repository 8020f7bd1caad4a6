//! Circuit breaker guarding calls to the knowledge service.
//!
//! Once the service has failed often enough, callers stop paying for
//! timeouts and get a fallback answer straight away.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! The Open → Half-Open transition is lazy: it happens inside [`CircuitBreaker::is_open`]
//! (or any other accessor) once the recovery timeout has elapsed, and that call
//! reports the circuit as passable so the caller can make the probe.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - every request is a trial.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful trials in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// When a rate limit (429) opens the circuit, multiply recovery_timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum recovery timeout after rate limit backoffs.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
        }
    }

    fn trip(&mut self, error: &AppError) {
        self.state = CircuitState::Open;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = Some(Instant::now());
        self.last_error_message = Some(error.to_string());
    }

    fn remaining_open_time(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.last_failure_time
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Error type for [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - request was rejected without calling the service.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} ms.",
                    name,
                    retry_after.as_millis()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => AppError::CircuitOpen {
                name,
                retry_after_ms: retry_after.as_millis() as u64,
            },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// True while calls should be skipped.
    ///
    /// Side effect: an Open circuit whose recovery timeout has elapsed moves
    /// to Half-Open here, and this call returns `false` so the caller makes
    /// the trial request.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open: inner.remaining_open_time(),
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    /// - HalfOpen: executes operation, transitions based on result
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            if inner.state == CircuitState::Open {
                let retry_after = inner
                    .remaining_open_time()
                    .unwrap_or(inner.current_recovery_timeout);

                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                if e.should_trip_circuit() {
                    self.record_failure(e);
                }
            }
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let should_close = {
            let mut inner = self.lock_inner();

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    let close = inner.success_count >= self.config.success_threshold;
                    if close {
                        tracing::info!(
                            circuit = %self.name,
                            "Circuit breaker closing after {} successful probes",
                            inner.success_count
                        );
                    }
                    close
                }
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    false
                }
                CircuitState::Open => false,
            }
        };

        if should_close {
            self.reset();
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.trip(error);
                    if error.is_rate_limit() {
                        self.extend_recovery_timeout(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.trip(error);
                if error.is_rate_limit() {
                    self.extend_recovery_timeout(&mut inner);
                }
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    /// Closes the circuit and zeroes every counter.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.last_error_message = None;
        inner.current_recovery_timeout = self.config.recovery_timeout;
    }

    fn extend_recovery_timeout(&self, inner: &mut CircuitBreakerInner) {
        inner.current_recovery_timeout = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_recovery_timeout.as_secs_f32()
                    * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_recovery_timeout,
        );
        tracing::info!(
            circuit = %self.name,
            recovery_timeout_ms = inner.current_recovery_timeout.as_millis() as u64,
            "Extended recovery timeout due to rate limit"
        );
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}
