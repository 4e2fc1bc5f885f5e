//! Circuit breaker model
//!
//! Mirrors the breaker the report service wraps around each data source, so
//! chaos scenarios can predict when calls should start fast-failing and the
//! property suite can check the state machine in isolation.

use crate::error::{HarnessError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Service call failed: {0}")]
    ServiceError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    NotInitialized,
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::NotInitialized => "not_initialized",
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = HarnessError;

    /// Anything outside the four known names is a protocol violation
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_initialized" => Ok(CircuitState::NotInitialized),
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half-open" => Ok(CircuitState::HalfOpen),
            other => Err(HarnessError::ProtocolViolation(format!(
                "Unknown circuit breaker state: {}",
                other
            ))),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub consecutive_failure_threshold: u32,
    /// Requests needed in the window before the failure rate counts
    pub min_requests: u32,
    /// Failure rate (0.0 to 1.0) that opens the circuit
    pub failure_rate_threshold: f64,
    /// Time window for counting requests and failures
    pub failure_window: Duration,
    /// How long to keep circuit open before trying half-open
    pub timeout_duration: Duration,
    /// Probe requests admitted while half-open
    pub half_open_max_requests: u32,
    /// Failures while half-open that send the circuit back to open
    pub half_open_failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 15,
            min_requests: 10,
            failure_rate_threshold: 0.5,
            failure_window: Duration::from_secs(60),
            timeout_duration: Duration::from_secs(30),
            half_open_max_requests: 3,
            half_open_failure_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window_start: Instant,
    window_requests: u32,
    window_failures: u32,
    consecutive_failures: u32,
    half_open_requests: u32,
    half_open_failures: u32,
    last_state_change: Instant,
}

impl Inner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::NotInitialized,
            window_start: now,
            window_requests: 0,
            window_failures: 0,
            consecutive_failures: 0,
            half_open_requests: 0,
            half_open_failures: 0,
            last_state_change: now,
        }
    }

    fn reset_counters(&mut self, now: Instant) {
        self.window_start = now;
        self.window_requests = 0;
        self.window_failures = 0;
        self.consecutive_failures = 0;
        self.half_open_requests = 0;
        self.half_open_failures = 0;
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        if self.state != to {
            log::info!("Circuit breaker {} -> {}", self.state, to);
            self.state = to;
            self.last_state_change = now;
            self.half_open_requests = 0;
            self.half_open_failures = 0;
        }
    }
}

/// Circuit breaker for one protected dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    circuit_opened_count: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new(Instant::now())),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            circuit_opened_count: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute a function with circuit breaker protection
    pub async fn call<F, T, E>(&self, f: F) -> std::result::Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> futures::future::BoxFuture<'static, std::result::Result<T, E>>,
        E: fmt::Display,
    {
        if !self.allow_request() {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::ServiceError(e.to_string()))
            }
        }
    }

    /// Whether a request may proceed now; admits a half-open probe when allowed
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::NotInitialized => {
                inner.transition(CircuitState::Closed, now);
                true
            }
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.duration_since(inner.last_state_change) >= self.config.timeout_duration {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.half_open_requests = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::NotInitialized | CircuitState::Closed => {
                inner.state = CircuitState::Closed;
                self.roll_window(&mut inner, now);
                inner.window_requests += 1;
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Closed, now);
                inner.reset_counters(now);
            }
            CircuitState::Open => {
                log::warn!("Success recorded in open state");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::NotInitialized | CircuitState::Closed => {
                inner.state = CircuitState::Closed;
                self.roll_window(&mut inner, now);
                inner.window_requests += 1;
                inner.window_failures += 1;
                inner.consecutive_failures += 1;
                if self.should_open(&inner) {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_failures += 1;
                if inner.half_open_failures >= self.config.half_open_failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn roll_window(&self, inner: &mut Inner, now: Instant) {
        if now.duration_since(inner.window_start) > self.config.failure_window {
            inner.window_start = now;
            inner.window_requests = 0;
            inner.window_failures = 0;
        }
    }

    fn should_open(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.config.consecutive_failure_threshold {
            return true;
        }
        inner.window_requests >= self.config.min_requests
            && f64::from(inner.window_failures) / f64::from(inner.window_requests)
                >= self.config.failure_rate_threshold
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.transition(CircuitState::Open, now);
        inner.reset_counters(now);
        self.circuit_opened_count.fetch_add(1, Ordering::AcqRel);
        log::warn!("Circuit breaker opened");
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// False iff the circuit is open
    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
        }
    }

    /// Reset circuit breaker to closed state
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, now);
        inner.reset_counters(now);
        log::info!("Circuit breaker manually reset");
    }
}

/// Statistics for circuit breaker monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub circuit_opened_count: u32,
}

/// One breaker per protected dependency, created on first use
pub struct CircuitBreakerManager {
    breakers: dashmap::DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: dashmap::DashMap::new(),
            default_config,
        }
    }

    /// Get or create a circuit breaker for a dependency
    pub fn get_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.default_config.clone())))
            .clone()
    }

    /// Get statistics for all circuit breakers
    pub fn all_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Names of dependencies whose circuit is open
    pub fn open_circuits(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|entry| !entry.value().is_healthy())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Reset all circuit breakers
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
