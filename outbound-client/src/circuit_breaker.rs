//! Circuit breaker state machine.
//!
//! Each breaker moves between three states:
//!
//! - **Closed**: calls pass through and outcomes are counted. With a non-zero
//!   interval the counts are cleared at every interval boundary. After a
//!   failure, the trip predicate decides whether to open.
//! - **Open**: calls are rejected without running. After the timeout the
//!   breaker becomes half-open.
//! - **HalfOpen**: up to `max_requests` trial calls run. Any failure reopens;
//!   `max_requests` consecutive successes close.
//!
//! Every state change starts a new generation. An outcome is only counted if
//! the generation has not changed since its call was admitted.

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{BreakerError, Error, Next, Request, Response, Result, Stage};

/// Default half-open trial budget.
pub const DEFAULT_MAX_REQUESTS: u32 = 1;
/// Default time a breaker stays open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
/// Consecutive failures above which the default trip predicate opens.
pub const DEFAULT_CONSECUTIVE_FAILURES: u32 = 5;

/// Predicate deciding whether counts warrant opening the breaker.
pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
/// Predicate deciding whether a response status counts as a failure.
pub type ShouldTrip = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;
/// Callback invoked with the breaker name and the old and new state.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Identifier of a breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitBreakerKey(Cow<'static, str>);

impl CircuitBreakerKey {
    /// Create a key from a static string.
    pub const fn from_static(key: &'static str) -> Self {
        Self(Cow::Borrowed(key))
    }

    /// Create a key from an owned string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(Cow::Owned(key.into()))
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitBreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CircuitBreakerKey {
    fn from(key: &'static str) -> Self {
        Self::from_static(key)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Limited trial calls pass through.
    HalfOpen,
    /// Calls are rejected.
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        })
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Calls admitted.
    pub requests: u32,
    /// Successful outcomes.
    pub total_successes: u32,
    /// Failed outcomes.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Settings for one breaker.
#[derive(Clone)]
pub struct BreakerSettings {
    /// Registry key.
    pub key: CircuitBreakerKey,
    /// Name used in errors and logs (defaults to the key).
    pub name: Option<String>,
    /// Half-open trial budget (0 means the default of 1).
    pub max_requests: u32,
    /// Closed-state count reset period (zero never resets).
    pub interval: Duration,
    /// Time spent open before trying half-open (zero means the default of 60s).
    pub timeout: Duration,
    ready_to_trip: Option<ReadyToTrip>,
    should_trip: Option<ShouldTrip>,
    on_state_change: Option<StateChangeHook>,
}

impl BreakerSettings {
    /// Create settings for a key with every default.
    pub fn new(key: impl Into<CircuitBreakerKey>) -> Self {
        Self {
            key: key.into(),
            name: None,
            max_requests: DEFAULT_MAX_REQUESTS,
            interval: Duration::ZERO,
            timeout: DEFAULT_OPEN_TIMEOUT,
            ready_to_trip: None,
            should_trip: None,
            on_state_change: None,
        }
    }

    /// Set the breaker name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the half-open trial budget.
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the closed-state count reset period.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set how long the breaker stays open.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the trip predicate over counts.
    pub fn ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Some(Arc::new(predicate));
        self
    }

    /// Set the predicate deciding which statuses count as failures.
    pub fn should_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.should_trip = Some(Arc::new(predicate));
        self
    }

    /// Set the state change callback, replacing the default error log.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("custom_ready_to_trip", &self.ready_to_trip.is_some())
            .field("custom_should_trip", &self.should_trip.is_some())
            .field("custom_on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Errors from [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker is open; the operation was not run.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },

    /// The half-open trial budget is in use; the operation was not run.
    #[error("circuit breaker '{name}' is half-open, too many requests")]
    TooManyRequests {
        /// Breaker name.
        name: String,
    },

    /// The operation ran and failed.
    #[error("{0}")]
    Execution(E),
}

impl<E> CircuitBreakerError<E> {
    /// Check whether the breaker refused to run the operation.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::TooManyRequests { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Open,
    TooManyRequests,
}

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

type Transitions = Vec<(CircuitState, CircuitState)>;

/// A single circuit breaker.
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: ReadyToTrip,
    should_trip: ShouldTrip,
    on_state_change: StateChangeHook,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker from settings, filling in defaults.
    pub fn new(settings: BreakerSettings) -> Self {
        let name = settings
            .name
            .unwrap_or_else(|| settings.key.as_str().to_string());
        let timeout = if settings.timeout.is_zero() {
            DEFAULT_OPEN_TIMEOUT
        } else {
            settings.timeout
        };

        let breaker = Self {
            name,
            max_requests: settings.max_requests.max(1),
            interval: settings.interval,
            timeout,
            ready_to_trip: settings
                .ready_to_trip
                .unwrap_or_else(|| Arc::new(default_ready_to_trip)),
            should_trip: settings
                .should_trip
                .unwrap_or_else(|| Arc::new(default_should_trip)),
            on_state_change: settings
                .on_state_change
                .unwrap_or_else(|| Arc::new(log_state_change)),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };

        {
            let mut inner = breaker.inner.lock();
            breaker.new_generation(&mut inner, Instant::now());
        }
        breaker
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any expired open timeout or closed interval.
    pub fn state(&self) -> CircuitState {
        let mut transitions = Transitions::new();
        let state = {
            let mut inner = self.inner.lock();
            self.current_state(&mut inner, Instant::now(), &mut transitions)
        };
        self.notify(transitions);
        state
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Check whether a status counts as a failure for this breaker.
    pub fn should_trip(&self, status: StatusCode) -> bool {
        (self.should_trip)(status)
    }

    /// Run an operation under the breaker.
    ///
    /// `Ok` counts as success and `Err` as failure. A dropped future counts
    /// as a failure.
    ///
    /// ```
    /// use outbound_client::{BreakerSettings, CircuitBreaker, CircuitBreakerError, CircuitState};
    ///
    /// # tokio_test::block_on(async {
    /// let breaker = CircuitBreaker::new(
    ///     BreakerSettings::new("ledger").ready_to_trip(|counts| counts.consecutive_failures >= 1),
    /// );
    ///
    /// let failed = breaker.call(|| async { Err::<u32, _>("unavailable") }).await;
    /// assert!(matches!(failed, Err(CircuitBreakerError::Execution("unavailable"))));
    /// assert_eq!(breaker.state(), CircuitState::Open);
    ///
    /// let rejected = breaker.call(|| async { Ok::<_, &str>(1) }).await;
    /// assert!(rejected.unwrap_err().is_rejected());
    /// # });
    /// ```
    pub async fn call<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let admission = self.admit().map_err(|rejection| match rejection {
            Rejection::Open => CircuitBreakerError::Open {
                name: self.name.clone(),
            },
            Rejection::TooManyRequests => CircuitBreakerError::TooManyRequests {
                name: self.name.clone(),
            },
        })?;

        let outcome = op().await;
        admission.record(outcome.is_ok());
        outcome.map_err(CircuitBreakerError::Execution)
    }

    /// Run an HTTP operation under the breaker.
    ///
    /// A response whose status satisfies the trip predicate counts as a
    /// failure and comes back as [`BreakerError::BadResponse`].
    pub async fn execute<F, Fut>(&self, op: F) -> std::result::Result<Response, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        let admission = self.admit().map_err(|rejection| match rejection {
            Rejection::Open => BreakerError::Open {
                name: self.name.clone(),
            },
            Rejection::TooManyRequests => BreakerError::TooManyRequests {
                name: self.name.clone(),
            },
        })?;

        match op().await {
            Ok(response) if self.should_trip(response.status()) => {
                admission.record(false);
                Err(BreakerError::BadResponse {
                    response: Box::new(response),
                })
            }
            Ok(response) => {
                admission.record(true);
                Ok(response)
            }
            Err(e) => {
                admission.record(false);
                Err(BreakerError::Request(e))
            }
        }
    }

    fn admit(&self) -> std::result::Result<Admission<'_>, Rejection> {
        let mut transitions = Transitions::new();
        let admitted = {
            let mut inner = self.inner.lock();
            let state = self.current_state(&mut inner, Instant::now(), &mut transitions);
            match state {
                CircuitState::Open => Err(Rejection::Open),
                CircuitState::HalfOpen if inner.counts.requests >= self.max_requests => {
                    Err(Rejection::TooManyRequests)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            }
        };
        self.notify(transitions);

        admitted.map(|generation| Admission {
            breaker: self,
            generation,
            recorded: false,
        })
    }

    fn record(&self, generation: u64, success: bool) {
        let mut transitions = Transitions::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let state = self.current_state(&mut inner, now, &mut transitions);
            if inner.generation != generation {
                debug!(breaker = %self.name, "Ignoring outcome from a previous generation");
            } else if success {
                self.on_success(&mut inner, state, now, &mut transitions);
            } else {
                self.on_failure(&mut inner, state, now, &mut transitions);
            }
        }
        self.notify(transitions);
    }

    fn on_success(&self, inner: &mut Inner, state: CircuitState, now: Instant, transitions: &mut Transitions) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.max_requests {
                    self.set_state(inner, CircuitState::Closed, now, transitions);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, state: CircuitState, now: Instant, transitions: &mut Transitions) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if (self.ready_to_trip)(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now, transitions);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now, transitions),
            CircuitState::Open => {}
        }
    }

    fn current_state(&self, inner: &mut Inner, now: Instant, transitions: &mut Transitions) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState, now: Instant, transitions: &mut Transitions) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);
        transitions.push((from, to));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.interval),
            CircuitState::Open => Some(now + self.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: Transitions) {
        for (from, to) in transitions {
            (self.on_state_change)(&self.name, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("counts", &inner.counts)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// An admitted call whose outcome has not been recorded yet.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    recorded: bool,
}

impl Admission<'_> {
    fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.generation, false);
        }
    }
}

fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.consecutive_failures > DEFAULT_CONSECUTIVE_FAILURES
}

/// Default trip predicate: any 5xx status.
pub fn default_should_trip(status: StatusCode) -> bool {
    status.as_u16() >= 500
}

fn log_state_change(name: &str, from: CircuitState, to: CircuitState) {
    error!(breaker = name, %from, %to, "Circuit breaker state changed");
}

/// Stage that guards the rest of a chain with a single breaker.
///
/// Statuses matching the trip predicate count as failures but the response
/// is still returned. While the breaker rejects calls the stage fails with
/// [`Error::CircuitOpen`] or [`Error::TooManyRequests`].
#[derive(Debug)]
pub struct CircuitBreakerStage {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerStage {
    /// Create a stage with its own breaker.
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_breaker(Arc::new(CircuitBreaker::new(settings)))
    }

    /// Create a stage around an existing breaker.
    pub fn with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// The guarding breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl Stage for CircuitBreakerStage {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response> {
        let breaker = &self.breaker;
        let admission = breaker.admit().map_err(|rejection| match rejection {
            Rejection::Open => Error::CircuitOpen {
                name: breaker.name.clone(),
            },
            Rejection::TooManyRequests => Error::TooManyRequests {
                name: breaker.name.clone(),
            },
        })?;

        let outcome = next.run(request).await;
        let success = matches!(&outcome, Ok(response) if !breaker.should_trip(response.status()));
        admission.record(success);
        outcome
    }

    fn name(&self) -> &'static str {
        "circuit_breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chain, Transport};
    use http::{HeaderMap, Method};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const USERS: CircuitBreakerKey = CircuitBreakerKey::from_static("users");

    fn response(status: StatusCode) -> Response {
        Response::from_parts(status, HeaderMap::new(), "")
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Ok::<_, &str>(()) }).await;
    }

    fn recording_hook() -> (Arc<Mutex<Vec<(String, CircuitState, CircuitState)>>>, BreakerSettings) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let settings = BreakerSettings::new(USERS).on_state_change(move |name, from, to| {
            sink.lock().push((name.to_string(), from, to));
        });
        (seen, settings)
    }

    #[test]
    fn test_defaults() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));
        assert_eq!(breaker.name(), "users");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.max_requests, 1);
        assert_eq!(breaker.timeout, Duration::from_secs(60));
        assert!(breaker.should_trip(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(breaker.should_trip(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!breaker.should_trip(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS)
                .name("user-service")
                .max_requests(0)
                .timeout(Duration::ZERO),
        );
        assert_eq!(breaker.name(), "user-service");
        assert_eq!(breaker.max_requests, 1);
        assert_eq!(breaker.timeout, DEFAULT_OPEN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_default_trips_after_more_than_five_consecutive_failures() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));

        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 5);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));
        for _ in 0..4 {
            fail(&breaker).await;
        }
        succeed(&breaker).await;

        let counts = breaker.counts();
        assert_eq!(counts.requests, 5);
        assert_eq!(counts.total_failures, 4);
        assert_eq!(counts.total_successes, 1);
        assert_eq!(counts.consecutive_failures, 0);
        assert_eq!(counts.consecutive_successes, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_running() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS).ready_to_trip(|counts| counts.consecutive_failures >= 1),
        );
        fail(&breaker).await;

        let ran = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { ref name }) if name == "users"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let (seen, settings) = recording_hook();
        let breaker = CircuitBreaker::new(
            settings
                .timeout(Duration::from_secs(30))
                .ready_to_trip(|counts| counts.consecutive_failures >= 1),
        );

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let seen = seen.lock();
        assert_eq!(
            seen.as_slice(),
            [
                ("users".to_string(), CircuitState::Closed, CircuitState::Open),
                ("users".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("users".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS)
                .max_requests(3)
                .timeout(Duration::from_secs(5))
                .ready_to_trip(|counts| counts.consecutive_failures >= 2),
        );
        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS)
                .max_requests(2)
                .timeout(Duration::from_secs(1))
                .ready_to_trip(|counts| counts.consecutive_failures >= 1),
        );
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let first = breaker.admit().unwrap();
        let second = breaker.admit().unwrap();
        assert_eq!(breaker.admit().err(), Some(Rejection::TooManyRequests));

        first.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        second.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_clears_closed_counts() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS).interval(Duration::from_secs(10)),
        );
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.counts().consecutive_failures, 5);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_outcome_from_previous_generation_is_ignored() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS).ready_to_trip(|counts| counts.consecutive_failures >= 1),
        );
        let stale = breaker.admit().unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        stale.record(true);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test]
    async fn test_dropped_call_counts_as_failure() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));
        drop(breaker.admit().unwrap());
        assert_eq!(breaker.counts().total_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_returns_bad_response_marker() {
        let breaker = CircuitBreaker::new(
            BreakerSettings::new(USERS).ready_to_trip(|counts| counts.consecutive_failures >= 1),
        );

        let err = breaker
            .execute(|| async { Ok(response(StatusCode::INTERNAL_SERVER_ERROR)) })
            .await
            .unwrap_err();
        assert_eq!(
            err.bad_response().map(Response::status),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );

        let calls = AtomicUsize::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(response(StatusCode::OK))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_counts_client_errors_as_success_by_default() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));
        let response = breaker
            .execute(|| async { Ok(response(StatusCode::NOT_FOUND)) })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(breaker.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_execute_surfaces_request_errors() {
        let breaker = CircuitBreaker::new(BreakerSettings::new(USERS));
        let err = breaker
            .execute(|| async { Err(Error::Connection("refused".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Request(Error::Connection(_))));
        assert_eq!(breaker.counts().consecutive_failures, 1);
    }

    struct Fixed(StatusCode, AtomicUsize);

    #[async_trait]
    impl Transport for Fixed {
        async fn send(&self, _request: Request) -> Result<Response> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(response(self.0))
        }
    }

    #[tokio::test]
    async fn test_stage_returns_response_then_rejects() {
        let transport = Arc::new(Fixed(StatusCode::BAD_GATEWAY, AtomicUsize::new(0)));
        let chain = Chain::new(transport.clone()).wrap(CircuitBreakerStage::new(
            BreakerSettings::new(USERS).ready_to_trip(|counts| counts.consecutive_failures >= 2),
        ));
        let request = || Request::new(Method::GET, "http://example.com".parse().unwrap());

        for _ in 0..2 {
            let response = chain.execute(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        let err = chain.execute(request()).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { ref name } if name == "users"));
        assert_eq!(transport.1.load(Ordering::SeqCst), 2);
    }
}
