//! Requests, bodies and the per-call context.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Error, HttpClient, Response, Result};

type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// Request body: either buffered bytes or a fallible byte stream.
///
/// A streamed body can only be read once. The retry stage buffers it before
/// the first attempt so every attempt can be sent with the same bytes.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Bytes(Bytes),
    Stream(BodyStream),
}

impl Body {
    /// Create an empty body.
    pub fn empty() -> Self {
        Self::from(Bytes::new())
    }

    /// Wrap a byte stream.
    pub fn wrap_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
    {
        Self {
            inner: BodyInner::Stream(Box::pin(stream)),
        }
    }

    /// Get the buffered bytes, if this body is not a stream.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.inner {
            BodyInner::Bytes(bytes) => Some(bytes),
            BodyInner::Stream(_) => None,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> std::io::Result<Bytes> {
        match self.inner {
            BodyInner::Bytes(bytes) => Ok(bytes),
            BodyInner::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub(crate) fn into_reqwest(self) -> reqwest::Body {
        match self.inner {
            BodyInner::Bytes(bytes) => reqwest::Body::from(bytes),
            BodyInner::Stream(stream) => reqwest::Body::wrap_stream(stream),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Bytes(bytes) => f.debug_tuple("Body").field(&bytes.len()).finish(),
            BodyInner::Stream(_) => f.write_str("Body(<stream>)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: BodyInner::Bytes(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::from(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from(Bytes::from_static(bytes))
    }
}

/// Key into a call's [`ContextValues`].
///
/// Define keys as constants so header configuration and call sites agree:
///
/// ```
/// use outbound_client::ContextKey;
///
/// const REQUEST_ID: ContextKey = ContextKey::from_static("request-id");
/// assert_eq!(REQUEST_ID.as_str(), "request-id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(Cow<'static, str>);

impl ContextKey {
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

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed lookup table of request-scoped values.
///
/// Values are stored as anything that can be displayed; header injection
/// renders them with [`fmt::Display`].
#[derive(Clone, Default)]
pub struct ContextValues {
    values: HashMap<ContextKey, Arc<dyn fmt::Display + Send + Sync>>,
}

impl ContextValues {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn insert<V>(&mut self, key: ContextKey, value: V)
    where
        V: fmt::Display + Send + Sync + 'static,
    {
        self.values.insert(key, Arc::new(value));
    }

    /// Set a value if present; `None` removes the key.
    pub fn insert_opt<V>(&mut self, key: ContextKey, value: Option<V>)
    where
        V: fmt::Display + Send + Sync + 'static,
    {
        match value {
            Some(value) => self.insert(key, value),
            None => {
                self.values.remove(&key);
            }
        }
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &ContextKey) {
        self.values.remove(key);
    }

    /// Render a value to its display string.
    pub fn get_string(&self, key: &ContextKey) -> Option<String> {
        self.values.get(key).map(|value| value.to_string())
    }

    /// Check whether a key is set.
    pub fn contains(&self, key: &ContextKey) -> bool {
        self.values.contains_key(key)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ContextValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(k, v)| (k.as_str(), v.to_string())))
            .finish()
    }
}

/// Cancellation, deadline and values scoped to a single call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    values: ContextValues,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value.
    pub fn with_value<V>(mut self, key: ContextKey, value: V) -> Self
    where
        V: fmt::Display + Send + Sync + 'static,
    {
        self.values.insert(key, value);
        self
    }

    /// Use an existing cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Bound the call by a deadline measured from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Bound the call by an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Context values.
    pub fn values(&self) -> &ContextValues {
        &self.values
    }

    /// Mutable context values.
    pub fn values_mut(&mut self) -> &mut ContextValues {
        &mut self.values
    }

    /// Cancellation token for the call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check whether the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Caller-supplied deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the caller-supplied deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Everything in a request except its body.
#[derive(Debug, Clone)]
pub struct RequestParts {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Per-call context.
    pub context: CallContext,
}

/// An outbound HTTP request.
#[derive(Debug)]
pub struct Request {
    parts: RequestParts,
    body: Option<Body>,
}

impl Request {
    /// Create a request without headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            parts: RequestParts {
                method,
                url,
                headers: HeaderMap::new(),
                context: CallContext::default(),
            },
            body: None,
        }
    }

    /// Reassemble a request.
    pub fn from_parts(parts: RequestParts, body: Option<Body>) -> Self {
        Self { parts, body }
    }

    /// Split a request into its parts and body.
    pub fn into_parts(self) -> (RequestParts, Option<Body>) {
        (self.parts, self.body)
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the context.
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.parts.context = context;
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    /// Target URL.
    pub fn url(&self) -> &Url {
        &self.parts.url
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    /// Request body.
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Take the body out of the request.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Per-call context.
    pub fn context(&self) -> &CallContext {
        &self.parts.context
    }

    /// Mutable per-call context.
    pub fn context_mut(&mut self) -> &mut CallContext {
        &mut self.parts.context
    }
}

/// HTTP request builder bound to a client.
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    method: Method,
    url: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Option<Body>,
    context: CallContext,
    error: Option<Error>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            context: CallContext::default(),
            error: None,
        }
    }

    /// Add a header to the request.
    ///
    /// An invalid name or value is reported when the request is sent.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        match (
            HeaderName::try_from(name),
            HeaderValue::try_from(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => {
                self.error
                    .get_or_insert_with(|| Error::InvalidHeader(name.to_string()));
            }
        }
        self
    }

    /// Add multiple headers to the request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = Some(Body::from(text.into()));
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, json: &T) -> Self {
        match serde_json::to_vec(json) {
            Ok(bytes) => {
                self.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                self.body = Some(Body::from(bytes));
            }
            Err(e) => {
                self.error.get_or_insert(Error::Json(e.to_string()));
            }
        }
        self
    }

    /// Set bearer authentication.
    pub fn bearer_auth(self, token: impl fmt::Display) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    /// Replace the call context.
    pub fn context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    /// Attach a context value, for example a request ID used by header injection.
    pub fn value<V>(mut self, key: ContextKey, value: V) -> Self
    where
        V: fmt::Display + Send + Sync + 'static,
    {
        self.context.values_mut().insert(key, value);
        self
    }

    /// Cancel the call when this token is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.context = self.context.with_cancellation(token);
        self
    }

    /// Bound this call by a deadline shorter than the client's timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.context = self.context.with_timeout(timeout);
        self
    }

    fn build_url(&self) -> Result<Url> {
        let mut url = if let Some(base) = &self.client.config().base_url {
            let base = Url::parse(base).map_err(|e| Error::InvalidUrl(e.to_string()))?;
            base.join(&self.url)
                .map_err(|e| Error::InvalidUrl(e.to_string()))?
        } else {
            Url::parse(&self.url).map_err(|e| Error::InvalidUrl(e.to_string()))?
        };

        if !self.query.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                query_pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Build the request without sending it.
    pub fn build(mut self) -> Result<Request> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let url = self.build_url()?;
        Ok(Request::from_parts(
            RequestParts {
                method: self.method,
                url,
                headers: self.headers,
                context: self.context,
            },
            self.body,
        ))
    }

    /// Send the request through the client's pipeline.
    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        let request = self.build()?;
        client.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const TRACE_ID: ContextKey = ContextKey::from_static("trace-id");

    #[tokio::test]
    async fn test_stream_body_collects_all_chunks() {
        let body = Body::wrap_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));
        assert!(body.as_bytes().is_none());
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_stream_body_propagates_read_error() {
        let body = Body::wrap_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("socket reset")),
        ]));
        let err = body.collect().await.unwrap_err();
        assert_eq!(err.to_string(), "socket reset");
    }

    #[test]
    fn test_context_values_render_display() {
        let mut values = ContextValues::new();
        values.insert(TRACE_ID, 42u64);
        assert_eq!(values.get_string(&TRACE_ID).as_deref(), Some("42"));

        values.insert_opt::<String>(TRACE_ID, None);
        assert!(!values.contains(&TRACE_ID));
        assert!(values.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_context_remaining() {
        let context = CallContext::new().with_timeout(Duration::from_secs(5));
        assert_eq!(context.remaining(), Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(context.remaining(), Some(Duration::ZERO));
        assert_eq!(CallContext::new().remaining(), None);
    }

    #[test]
    fn test_request_parts_roundtrip_keeps_context() {
        let url = Url::parse("http://example.com/items").unwrap();
        let request = Request::new(Method::PUT, url)
            .with_context(CallContext::new().with_value(TRACE_ID, "abc"))
            .with_body("payload");
        let (parts, body) = request.into_parts();
        assert_eq!(parts.method, Method::PUT);
        assert_eq!(parts.context.values().get_string(&TRACE_ID).as_deref(), Some("abc"));

        let rebuilt = Request::from_parts(parts, body);
        assert_eq!(
            rebuilt.body().and_then(Body::as_bytes),
            Some(&Bytes::from_static(b"payload"))
        );
    }
}
