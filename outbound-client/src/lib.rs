//! # Outbound Client
//!
//! A resilient outbound HTTP pipeline: idempotency-aware retries with
//! exponential backoff and `Retry-After` support, keyed circuit breakers,
//! header injection and connection pool tuning on top of `reqwest`.
//!
//! ## Features
//!
//! - **Retry with Backoff**: only idempotent methods are replayed, bodies are buffered once
//! - **Deadline Validation**: worst-case backoff is checked against the client timeout at construction
//! - **Circuit Breakers**: a registry of independent breakers keyed by endpoint
//! - **Header Injection**: static and context-derived headers, never overriding the caller
//! - **Connection Pooling**: idle limits, per-host caps, header timeouts and size limits
//! - **Instrumentation**: a `tracing` span around every attempt
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use outbound_client::{HttpClient, PipelineConfig, RetrySettings};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder(Duration::from_secs(30))
//!         .retry(RetrySettings::default())
//!         .static_header("X-API-Key", "secret")
//!         .build();
//!
//!     let client = HttpClient::new(config)?;
//!
//!     let response = client
//!         .get("https://api.example.com/users")
//!         .send()
//!         .await?;
//!
//!     println!("Status: {}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! ## With Circuit Breakers
//!
//! ```rust,no_run
//! use outbound_client::{BreakerSettings, CircuitBreakerKey, HttpClient, PipelineConfig};
//! use std::time::Duration;
//!
//! const ORDERS: CircuitBreakerKey = CircuitBreakerKey::from_static("orders");
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder(Duration::from_secs(10))
//!         .circuit_breaker(
//!             BreakerSettings::new(ORDERS)
//!                 .timeout(Duration::from_secs(30))
//!                 .ready_to_trip(|counts| counts.consecutive_failures >= 3),
//!         )
//!         .build();
//!
//!     let client = HttpClient::new(config)?;
//!
//!     match client
//!         .execute_with_breaker(&ORDERS, || {
//!             client
//!                 .post("https://orders.internal/orders")
//!                 .json(&serde_json::json!({"item": "widget", "quantity": 5}))
//!                 .send()
//!         })
//!         .await
//!     {
//!         Ok(response) => println!("Created: {}", response.status()),
//!         Err(e) if e.is_open() => println!("Orders service unavailable"),
//!         Err(e) => return Err(e.to_string().into()),
//!     }
//!
//!     Ok(())
//! }
//! ```

mod circuit_breaker;
mod client;
mod config;
mod error;
mod headers;
mod instrumentation;
mod middleware;
mod pool;
mod registry;
mod request;
mod response;
mod retry;

pub use circuit_breaker::{
    BreakerSettings, CircuitBreaker, CircuitBreakerError, CircuitBreakerKey, CircuitBreakerStage,
    CircuitState, Counts, ReadyToTrip, ShouldTrip, StateChangeHook, default_should_trip,
};
pub use client::HttpClient;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{BreakerError, ConfigError, Error, Result};
pub use headers::{HeaderInjectionStage, HeaderSettings};
pub use instrumentation::InstrumentationStage;
pub use middleware::{Chain, Next, Stage, Transport};
pub use pool::{PoolSettings, PooledTransport};
pub use registry::CircuitBreakerRegistry;
pub use request::{Body, CallContext, ContextKey, ContextValues, Request, RequestBuilder, RequestParts};
pub use response::Response;
pub use retry::{
    ExponentialBackoff, RetryPolicy, RetrySettings, RetryStage, is_idempotent, parse_retry_after,
};

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use outbound_client::prelude::*;
/// ```
pub mod prelude {
    pub use crate::circuit_breaker::{BreakerSettings, CircuitBreakerKey, CircuitState};
    pub use crate::client::HttpClient;
    pub use crate::config::{PipelineConfig, PipelineConfigBuilder};
    pub use crate::error::{BreakerError, ConfigError, Error, Result};
    pub use crate::headers::HeaderSettings;
    pub use crate::pool::PoolSettings;
    pub use crate::request::{CallContext, ContextKey, RequestBuilder};
    pub use crate::response::Response;
    pub use crate::retry::RetrySettings;
    pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
}
