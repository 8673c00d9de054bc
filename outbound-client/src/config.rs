//! Pipeline configuration.

use std::time::Duration;

use crate::{BreakerSettings, ConfigError, HeaderSettings, PoolSettings, RetrySettings};

/// Immutable configuration for an [`HttpClient`](crate::HttpClient).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Overall deadline for one logical call, including every retry.
    pub timeout: Duration,
    /// Retry settings; `None` disables retries.
    pub retry: Option<RetrySettings>,
    /// Header injection; `None` disables the stage.
    pub headers: Option<HeaderSettings>,
    /// Connection pool tuning.
    pub pool: PoolSettings,
    /// Breakers registered on the client.
    pub circuit_breakers: Vec<BreakerSettings>,
    /// Wrap each attempt in a tracing span.
    pub instrumentation: bool,
    /// Base URL that relative request paths are joined onto.
    pub base_url: Option<String>,
    /// User agent string.
    pub user_agent: Option<String>,
}

impl PipelineConfig {
    /// Create a configuration builder with the overall call timeout.
    pub fn builder(timeout: Duration) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self {
                timeout,
                retry: None,
                headers: None,
                pool: PoolSettings::default(),
                circuit_breakers: Vec::new(),
                instrumentation: true,
                base_url: None,
                user_agent: Some(format!("outbound-client/{}", env!("CARGO_PKG_VERSION"))),
            },
        }
    }

    /// Check the configuration without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }
        if let Some(retry) = &self.retry {
            retry.resolve().validate_against(self.timeout)?;
        }
        if let Some(headers) = &self.headers {
            headers.compile()?;
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the overall call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enable retries.
    pub fn retry(mut self, settings: RetrySettings) -> Self {
        self.config.retry = Some(settings);
        self
    }

    /// Enable header injection.
    pub fn headers(mut self, settings: HeaderSettings) -> Self {
        self.config.headers = Some(settings);
        self
    }

    /// Add a static header, enabling header injection.
    pub fn static_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = self.config.headers.take().unwrap_or_default();
        self.config.headers = Some(headers.static_header(name, value));
        self
    }

    /// Set connection pool tuning.
    pub fn pool(mut self, settings: PoolSettings) -> Self {
        self.config.pool = settings;
        self
    }

    /// Register a circuit breaker.
    pub fn circuit_breaker(mut self, settings: BreakerSettings) -> Self {
        self.config.circuit_breakers.push(settings);
        self
    }

    /// Register several circuit breakers.
    pub fn circuit_breakers(mut self, settings: impl IntoIterator<Item = BreakerSettings>) -> Self {
        self.config.circuit_breakers.extend(settings);
        self
    }

    /// Enable or disable the instrumentation stage.
    pub fn instrumentation(mut self, enable: bool) -> Self {
        self.config.instrumentation = enable;
        self
    }

    /// Set the base URL for relative request paths.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
