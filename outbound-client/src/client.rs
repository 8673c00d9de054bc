//! HTTP client and pipeline assembly.

use http::{Method, StatusCode};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    BreakerError, Chain, CircuitBreaker, CircuitBreakerKey, CircuitBreakerRegistry, ConfigError,
    Error, InstrumentationStage, PipelineConfig, PooledTransport, Request, RequestBuilder,
    Response, Result, RetryStage, Transport,
};

/// HTTP client running every request through the outbound pipeline.
///
/// The chain is assembled once, innermost first: pooled transport, header
/// injection, instrumentation, retry. Cloning is cheap and clones share the
/// connection pool and breaker state.
#[derive(Clone)]
pub struct HttpClient {
    chain: Arc<Chain>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: Arc<PipelineConfig>,
}

impl HttpClient {
    /// Create a client over a pooled `reqwest` transport.
    pub fn new(config: PipelineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let transport =
            PooledTransport::with_user_agent(&config.pool, config.user_agent.as_deref())?;
        Self::assemble(config, Arc::new(transport))
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Self::assemble(config, transport)
    }

    fn assemble(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut chain = Chain::new(transport);

        if let Some(headers) = config.headers.as_ref().filter(|h| !h.is_empty()) {
            chain = chain.wrap(headers.compile()?);
        }
        if config.instrumentation {
            chain = chain.wrap(InstrumentationStage::new());
        }
        if let Some(retry) = &config.retry {
            let policy = retry.resolve();
            policy.validate_against(config.timeout)?;
            chain = chain.wrap(RetryStage::new(policy));
        }

        let breakers = CircuitBreakerRegistry::new(config.circuit_breakers.iter().cloned());

        info!(
            timeout = ?config.timeout,
            stages = ?chain.stage_names(),
            breakers = breakers.len(),
            "Outbound HTTP client ready"
        );

        Ok(Self {
            chain: Arc::new(chain),
            breakers: Arc::new(breakers),
            config: Arc::new(config),
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stage names, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.chain.stage_names()
    }

    /// Create a GET request builder.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::GET, url.into())
    }

    /// Create a POST request builder.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::POST, url.into())
    }

    /// Create a PUT request builder.
    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::PUT, url.into())
    }

    /// Create a PATCH request builder.
    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::PATCH, url.into())
    }

    /// Create a DELETE request builder.
    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::DELETE, url.into())
    }

    /// Create a HEAD request builder.
    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::HEAD, url.into())
    }

    /// Create a request builder with a custom method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    /// Run a prepared request through the pipeline.
    ///
    /// The whole call, retries included, is bounded by the client timeout or
    /// the request's own deadline, whichever is sooner. Cancelling the
    /// request's token abandons the call at once.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let budget = match request.context().remaining() {
            Some(remaining) => remaining.min(self.config.timeout),
            None => self.config.timeout,
        };
        let cancellation = request.context().cancellation().clone();

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!("Request cancelled by caller");
                return Err(Error::Cancelled);
            }
            outcome = tokio::time::timeout(budget, self.chain.execute(request)) => outcome,
        };

        outcome.map_err(|_| Error::DeadlineExceeded(budget))?
    }

    /// Get a registered breaker, if any.
    pub fn get_breaker(&self, key: &CircuitBreakerKey) -> Option<&CircuitBreaker> {
        self.breakers.get(key)
    }

    /// Get a registered breaker.
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub fn breaker(&self, key: &CircuitBreakerKey) -> &CircuitBreaker {
        self.breakers.breaker(key)
    }

    /// Check whether a status counts as a failure for a registered breaker.
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub fn should_trip(&self, key: &CircuitBreakerKey, status: StatusCode) -> bool {
        self.breakers.should_trip(key, status)
    }

    /// Run an HTTP operation under a registered breaker.
    ///
    /// ```rust,no_run
    /// use outbound_client::{CircuitBreakerKey, HttpClient};
    ///
    /// const USERS: CircuitBreakerKey = CircuitBreakerKey::from_static("users");
    ///
    /// # async fn fetch(client: HttpClient) {
    /// let outcome = client
    ///     .execute_with_breaker(&USERS, || client.get("https://users.internal/me").send())
    ///     .await;
    /// # }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `key` was not registered.
    pub async fn execute_with_breaker<F, Fut>(
        &self,
        key: &CircuitBreakerKey,
        op: F,
    ) -> std::result::Result<Response, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        self.breakers.execute(key, op).await
    }

    /// The breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("stages", &self.chain.stage_names())
            .field("timeout", &self.config.timeout)
            .field("breakers", &self.breakers.len())
            .finish()
    }
}
