//! Retry configuration, backoff schedule and the retry stage.
//!
//! Only idempotent methods are retried. A retry is triggered by a transport
//! failure or by a status in the retriable set; anything else is returned as
//! soon as it arrives. Waits grow exponentially from the initial interval up
//! to the max interval, except that a valid `Retry-After` on a 429 or 503
//! replaces the exponential step for that one wait.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::{Body, ConfigError, Error, Next, Request, Response, Result, Stage};

/// Longest `Retry-After` delay that will be honored.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default first backoff interval.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
/// Default backoff ceiling.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
/// Default backoff growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Default retriable status codes.
pub const DEFAULT_RETRIABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

/// Retry settings as supplied by the caller.
///
/// Every unset field falls back to its default independently; see
/// [`RetrySettings::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt (default 3).
    pub max_retries: Option<u32>,
    /// Wait before the first retry (default 500ms).
    pub initial_interval: Option<Duration>,
    /// Ceiling for any single wait (default 60s).
    pub max_interval: Option<Duration>,
    /// Growth factor applied after each wait (default 1.5).
    pub multiplier: Option<f64>,
    /// Statuses that trigger a retry (default 429, 502, 503, 504).
    pub retriable_status_codes: Option<BTreeSet<u16>>,
}

impl RetrySettings {
    /// Create settings that use every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries after the first attempt.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the first backoff interval.
    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval);
        self
    }

    /// Set the backoff ceiling.
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Set the backoff growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Replace the retriable status codes.
    pub fn retriable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retriable_status_codes = Some(codes.into_iter().collect());
        self
    }

    /// Fill in defaults for every unset field.
    pub fn resolve(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            initial_interval: self.initial_interval.unwrap_or(DEFAULT_INITIAL_INTERVAL),
            max_interval: self.max_interval.unwrap_or(DEFAULT_MAX_INTERVAL),
            multiplier: self.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
            retriable_status_codes: self
                .retriable_status_codes
                .clone()
                .unwrap_or_else(|| DEFAULT_RETRIABLE_STATUS_CODES.into_iter().collect()),
        }
    }
}

/// Fully resolved retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    retriable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().resolve()
    }
}

impl RetryPolicy {
    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// First backoff interval.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Backoff ceiling.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Backoff growth factor.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: StatusCode) -> bool {
        self.retriable_status_codes.contains(&status.as_u16())
    }

    /// Fresh backoff schedule for one call.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current: self.initial_interval,
            max: self.max_interval,
            multiplier: self.multiplier,
        }
    }

    /// Sum of every wait if all retries are used and none honors `Retry-After`.
    pub fn worst_case_backoff(&self) -> Duration {
        let mut backoff = self.backoff();
        let mut total = Duration::ZERO;
        for taken in 0..self.max_retries {
            let interval = backoff.next_interval();
            // Once the schedule stops growing every remaining wait is the same.
            if backoff.current.min(self.max_interval) == interval {
                let remaining = self.max_retries - taken;
                let rest = interval.checked_mul(remaining).unwrap_or(Duration::MAX);
                return total.saturating_add(rest);
            }
            total = total.saturating_add(interval);
        }
        total
    }

    /// Check the policy on its own and against the overall call timeout.
    pub fn validate_against(&self, timeout: Duration) -> std::result::Result<(), ConfigError> {
        if self.initial_interval.is_zero() {
            return Err(ConfigError::InvalidInitialInterval(self.initial_interval));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::MaxIntervalBelowInitial {
                max: self.max_interval,
                initial: self.initial_interval,
            });
        }
        // `!(x >= 1.0)` also rejects NaN.
        if !(self.multiplier >= 1.0) || self.multiplier.is_infinite() {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.retriable_status_codes.is_empty() {
            return Err(ConfigError::EmptyRetriableStatusCodes);
        }
        if let Some(&code) = self
            .retriable_status_codes
            .iter()
            .find(|&&code| StatusCode::from_u16(code).is_err())
        {
            return Err(ConfigError::InvalidStatusCode(code));
        }

        let worst_case = self.worst_case_backoff();
        if worst_case >= timeout {
            return Err(ConfigError::BackoffExceedsTimeout {
                worst_case,
                timeout,
            });
        }

        Ok(())
    }
}

/// Capped exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Next wait, advancing the schedule.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current.min(self.max);
        self.current = Duration::try_from_secs_f64(interval.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        interval
    }
}

/// Whether a method is safe to send more than once.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

/// Parse a `Retry-After` value relative to `now`.
///
/// Accepts delta-seconds or an HTTP-date. Returns `None` for anything that is
/// not strictly positive and at most [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds)
            .ok()
            .map(Duration::from_secs)
            .filter(|d| !d.is_zero() && *d <= MAX_RETRY_AFTER);
    }

    let date = httpdate::parse_http_date(value).ok()?;
    date.duration_since(now)
        .ok()
        .filter(|d| !d.is_zero() && *d <= MAX_RETRY_AFTER)
}

fn retry_after_for(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, SystemTime::now())
}

/// Stage that replays idempotent requests on transient failure.
#[derive(Debug, Clone)]
pub struct RetryStage {
    policy: RetryPolicy,
}

impl RetryStage {
    /// Create a retry stage with a resolved policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Stage for RetryStage {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response> {
        if !is_idempotent(request.method()) {
            return next.run(request).await;
        }

        let (parts, body) = request.into_parts();
        let body = match body {
            Some(body) => Some(body.collect().await.map_err(Error::Body)?),
            None => None,
        };

        let cancellation = parts.context.cancellation().clone();
        let max_attempts = self.policy.max_attempts();
        let mut backoff = self.policy.backoff();
        let mut attempt = 1;

        loop {
            let attempt_request = Request::from_parts(parts.clone(), body.clone().map(Body::from));
            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                outcome = next.run(attempt_request) => outcome,
            };
            let last_attempt = attempt >= max_attempts;

            let retry_after = match outcome {
                Ok(response) if !self.policy.should_retry_status(response.status()) => {
                    return Ok(response);
                }
                Ok(response) if last_attempt => {
                    warn!(
                        method = %parts.method,
                        url = %parts.url,
                        attempts = attempt,
                        status = %response.status(),
                        "Retries exhausted, returning last response"
                    );
                    return Ok(response);
                }
                Err(e) if last_attempt => {
                    warn!(
                        method = %parts.method,
                        url = %parts.url,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Retrying request after transport error");
                    None
                }
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after_for(status, response.headers());
                    debug!(attempt, %status, ?retry_after, "Retrying request due to status code");
                    if let Err(e) = response.drain().await {
                        debug!(error = %e, "Failed to drain retried response body");
                    }
                    retry_after
                }
            };

            let wait = retry_after.unwrap_or_else(|| backoff.next_interval());
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}
