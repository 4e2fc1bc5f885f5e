//! Retry and circuit-breaker models
//!
//! Provides the retry executor used by probes and provisioning, plus the
//! reference models of the report service's own breaker and backoff.

pub mod circuit_breaker;
pub mod retry_backoff;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager, CircuitBreakerStats,
    CircuitState,
};
pub use retry_backoff::{BackoffModel, BackoffStrategy, RetryConfig, RetryConfigBuilder, RetryExecutor};
