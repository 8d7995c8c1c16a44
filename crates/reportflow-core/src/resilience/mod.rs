//! Retry with exponential backoff and a persisted circuit breaker.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker};
pub use retry::{RetryPolicy, backoff_delay, with_retry, with_retry_if};
