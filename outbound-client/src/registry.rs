//! Keyed collection of circuit breakers.

use http::StatusCode;
use std::collections::HashMap;
use std::future::Future;
use tracing::warn;

use crate::{BreakerError, BreakerSettings, CircuitBreaker, CircuitBreakerKey, Response, Result};

/// Breakers by key, fixed at construction.
///
/// Looking up a key that was never registered through one of the panicking
/// accessors is a programming error and panics with the key name. Use
/// [`get`](Self::get) to probe.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<CircuitBreakerKey, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    /// Build a registry from breaker settings. A repeated key replaces the earlier entry.
    pub fn new(settings: impl IntoIterator<Item = BreakerSettings>) -> Self {
        let mut breakers = HashMap::new();
        for settings in settings {
            let key = settings.key.clone();
            if breakers
                .insert(key.clone(), CircuitBreaker::new(settings))
                .is_some()
            {
                warn!(key = %key, "Duplicate circuit breaker key, keeping the last settings");
            }
        }
        Self { breakers }
    }

    /// Look up a breaker.
    pub fn get(&self, key: &CircuitBreakerKey) -> Option<&CircuitBreaker> {
        self.breakers.get(key)
    }

    /// Get a registered breaker.
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub fn breaker(&self, key: &CircuitBreakerKey) -> &CircuitBreaker {
        match self.breakers.get(key) {
            Some(breaker) => breaker,
            None => panic!("circuit breaker not registered for key: {key}"),
        }
    }

    /// Check whether a status counts as a failure for a registered breaker.
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub fn should_trip(&self, key: &CircuitBreakerKey, status: StatusCode) -> bool {
        self.breaker(key).should_trip(status)
    }

    /// Run an HTTP operation under a registered breaker.
    ///
    /// See [`CircuitBreaker::execute`].
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub async fn execute<F, Fut>(
        &self,
        key: &CircuitBreakerKey,
        op: F,
    ) -> std::result::Result<Response, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        self.breaker(key).execute(op).await
    }

    /// Registered keys.
    pub fn keys(&self) -> impl Iterator<Item = &CircuitBreakerKey> {
        self.breakers.keys()
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Check whether no breaker is registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
