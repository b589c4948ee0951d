//! Resilience patterns for keyrelay-runtime.
//!
//! This module provides:
//! - Retry with capped exponential backoff
//! - Per-provider circuit breaker

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{retry, RetryPolicy};
