//! Pooled network transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use crate::{ConfigError, Error, Request, Response, Result, Transport};

/// Response header limit applied when none is configured (10 MiB).
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 10 << 20;

/// Connection pool and transport tuning.
///
/// Unset fields keep the underlying client's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Idle connections kept per host.
    pub max_idle_per_host: Option<usize>,
    /// Concurrent connections per host; unset is unlimited.
    pub max_connections_per_host: Option<usize>,
    /// How long an idle connection stays in the pool.
    pub idle_timeout: Option<Duration>,
    /// Time allowed to establish a connection, including the TLS handshake.
    pub connect_timeout: Option<Duration>,
    /// Time allowed between sending a request and receiving response headers.
    pub response_header_timeout: Option<Duration>,
    /// TCP keep-alive probe interval.
    pub tcp_keepalive: Option<Duration>,
    /// Never reuse connections.
    pub disable_keep_alives: bool,
    /// Do not negotiate gzip or brotli responses.
    pub disable_compression: bool,
    /// Largest accepted response header block.
    pub max_response_header_bytes: Option<usize>,
}

impl PoolSettings {
    /// Create settings that keep every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set idle connections kept per host.
    pub fn max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = Some(max);
        self
    }

    /// Cap concurrent connections per host.
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = Some(max);
        self
    }

    /// Set the idle connection timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the connect and handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the response header timeout.
    pub fn response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = Some(timeout);
        self
    }

    /// Set the TCP keep-alive interval.
    pub fn tcp_keepalive(mut self, interval: Duration) -> Self {
        self.tcp_keepalive = Some(interval);
        self
    }

    /// Disable connection reuse.
    pub fn disable_keep_alives(mut self, disable: bool) -> Self {
        self.disable_keep_alives = disable;
        self
    }

    /// Disable response compression.
    pub fn disable_compression(mut self, disable: bool) -> Self {
        self.disable_compression = disable;
        self
    }

    /// Set the response header size limit.
    pub fn max_response_header_bytes(mut self, max: usize) -> Self {
        self.max_response_header_bytes = Some(max);
        self
    }
}

/// Per-host connection cap.
///
/// Origins with no permit held or awaited are dropped whenever a new origin
/// is added.
#[derive(Debug)]
struct HostLimits {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    fn new(per_host: usize) -> Self {
        Self {
            per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, url: &Url) -> Result<OwnedSemaphorePermit> {
        let origin = url.origin().ascii_serialization();
        let semaphore = {
            let mut hosts = self.hosts.lock();
            if !hosts.contains_key(&origin) {
                // Held permits and waiters each keep a reference to the semaphore.
                hosts.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
            }
            hosts
                .entry(origin)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection("host connection limit closed".into()))
    }
}

/// Leaf transport backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct PooledTransport {
    client: reqwest::Client,
    response_header_timeout: Option<Duration>,
    max_response_header_bytes: usize,
    host_limits: Option<Arc<HostLimits>>,
}

impl PooledTransport {
    /// Build a transport from pool settings.
    pub fn new(settings: &PoolSettings) -> std::result::Result<Self, ConfigError> {
        Self::with_user_agent(settings, None)
    }

    /// Build a transport that sends a `User-Agent` on every request.
    pub fn with_user_agent(
        settings: &PoolSettings,
        user_agent: Option<&str>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .gzip(!settings.disable_compression)
            .brotli(!settings.disable_compression);

        if let Some(max) = settings.max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max);
        }
        if settings.disable_keep_alives {
            builder = builder.pool_max_idle_per_host(0);
        }
        if let Some(timeout) = settings.idle_timeout {
            builder = builder.pool_idle_timeout(timeout);
        }
        if let Some(timeout) = settings.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(interval) = settings.tcp_keepalive {
            builder = builder.tcp_keepalive(interval);
        }
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            response_header_timeout: settings.response_header_timeout.filter(|t| !t.is_zero()),
            max_response_header_bytes: settings
                .max_response_header_bytes
                .filter(|&max| max > 0)
                .unwrap_or(DEFAULT_MAX_RESPONSE_HEADER_BYTES),
            host_limits: settings
                .max_connections_per_host
                .filter(|&max| max > 0)
                .map(|max| Arc::new(HostLimits::new(max))),
        })
    }

    /// The underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

fn header_block_size(headers: &http::HeaderMap) -> usize {
    // name: value\r\n
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum()
}

#[async_trait]
impl Transport for PooledTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let permit = match &self.host_limits {
            Some(limits) => Some(limits.acquire(request.url()).await?),
            None => None,
        };

        let (parts, body) = request.into_parts();
        let mut builder = self
            .client
            .request(parts.method, parts.url)
            .headers(parts.headers);
        if let Some(body) = body {
            builder = builder.body(body.into_reqwest());
        }
        let request = builder.build()?;

        let pending = self.client.execute(request);
        let response = match self.response_header_timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending)
                .await
                .map_err(|_| Error::Timeout(timeout))??,
            None => pending.await?,
        };

        let size = header_block_size(response.headers());
        if size > self.max_response_header_bytes {
            debug!(size, limit = self.max_response_header_bytes, "Rejecting oversized response headers");
            return Err(Error::ResponseHeadersTooLarge {
                size,
                limit: self.max_response_header_bytes,
            });
        }

        Ok(Response::from_reqwest(response, permit))
    }
}
