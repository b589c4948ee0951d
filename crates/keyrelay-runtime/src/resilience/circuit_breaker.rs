//! Circuit breaker to prevent cascade failures.
//!
//! When a provider keeps failing with retryable errors, its circuit opens
//! and further calls fail fast with `SERVER_ERROR` until the recovery
//! timeout passes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration_str;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failed calls before opening circuit
    pub failure_threshold: u32,

    /// Time before a trial call is allowed through
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Successes needed to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Circuit is open, calls fail fast
    Open { opened_at: Instant },

    /// Testing if circuit can close
    HalfOpen { successes: u32 },
}

/// Per-provider circuit breaker.
///
/// Each provider has its own circuit so an outage at one vendor does not
/// block the others.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitState>>,
    config: CircuitBreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("states", &*self.states.read())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if circuit is open for a provider.
    ///
    /// An open circuit whose recovery timeout has passed moves to half-open
    /// and lets the caller through.
    pub fn is_open(&self, provider: &str) -> bool {
        let states = self.states.read();
        match states.get(provider) {
            Some(CircuitState::Open { opened_at }) => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    drop(states);
                    self.transition_to_half_open(provider);
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Record a successful provider call.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.write();
        match states.get(provider).cloned() {
            Some(CircuitState::HalfOpen { successes }) => {
                if successes + 1 >= self.config.success_threshold {
                    states.insert(provider.to_string(), CircuitState::Closed { failures: 0 });
                    tracing::info!(provider, "Circuit closed after successful recovery");
                } else {
                    states.insert(
                        provider.to_string(),
                        CircuitState::HalfOpen {
                            successes: successes + 1,
                        },
                    );
                }
            }
            Some(CircuitState::Closed { failures }) if failures > 0 => {
                states.insert(provider.to_string(), CircuitState::Closed { failures: 0 });
            }
            _ => {}
        }
    }

    /// Record a failed provider call.
    pub fn record_failure(&self, provider: &str) {
        let mut states = self.states.write();
        let failures = match states.get(provider) {
            None => 0,
            Some(CircuitState::Closed { failures }) => *failures,
            Some(CircuitState::HalfOpen { .. }) => {
                states.insert(
                    provider.to_string(),
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
                tracing::warn!(provider, "Circuit reopened after failed recovery attempt");
                return;
            }
            Some(CircuitState::Open { .. }) => return,
        };

        if failures + 1 >= self.config.failure_threshold {
            states.insert(
                provider.to_string(),
                CircuitState::Open {
                    opened_at: Instant::now(),
                },
            );
            tracing::warn!(
                provider,
                failures = failures + 1,
                "Circuit opened after repeated failures"
            );
        } else {
            states.insert(
                provider.to_string(),
                CircuitState::Closed {
                    failures: failures + 1,
                },
            );
        }
    }

    fn transition_to_half_open(&self, provider: &str) {
        let mut states = self.states.write();
        if matches!(states.get(provider), Some(CircuitState::Open { .. })) {
            states.insert(provider.to_string(), CircuitState::HalfOpen { successes: 0 });
            tracing::info!(provider, "Circuit half-open, allowing trial call");
        }
    }

    /// Get current state of a circuit.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.states
            .read()
            .get(provider)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
