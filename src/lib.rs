// Outbound - resilient outbound HTTP for services
//
// This library wraps a pooled HTTP transport in a fixed pipeline of header
// injection, instrumentation and idempotency-aware retry, with a registry of
// keyed circuit breakers for guarding calls to individual dependencies.

//! Resilient outbound HTTP.
//!
//! ```
//! use outbound::prelude::*;
//! use std::time::Duration;
//!
//! const LEDGER: CircuitBreakerKey = CircuitBreakerKey::from_static("ledger");
//!
//! # tokio_test::block_on(async {
//! let client = HttpClient::new(
//!     PipelineConfig::builder(Duration::from_secs(30))
//!         .retry(RetrySettings::new().max_retries(2))
//!         .circuit_breaker(BreakerSettings::new(LEDGER))
//!         .build(),
//! )
//! .unwrap();
//!
//! assert_eq!(client.stage_names(), vec!["retry", "instrumentation"]);
//! assert_eq!(client.breaker(&LEDGER).state(), CircuitState::Closed);
//! # });
//! ```

// Re-export the client crate
pub use outbound_client::*;

// Re-export serialization helpers used with request and response bodies
pub use serde;
pub use serde_json;
