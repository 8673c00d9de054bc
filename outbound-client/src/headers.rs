//! Static and context-derived header injection.

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tracing::warn;

use crate::{ConfigError, ContextKey, Next, Request, Response, Result, Stage};

/// Headers added to every request that does not already carry them.
///
/// Static headers carry a fixed value. Context headers are read from the
/// call's [`ContextValues`](crate::ContextValues) and rendered with `Display`;
/// a key missing from the context simply leaves the header out.
#[derive(Debug, Clone, Default)]
pub struct HeaderSettings {
    /// Header name to fixed value.
    pub static_headers: BTreeMap<String, String>,
    /// Header name to the context key holding its value.
    pub context_headers: BTreeMap<String, ContextKey>,
}

impl HeaderSettings {
    /// Create empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a static header.
    pub fn static_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_headers.insert(name.into(), value.into());
        self
    }

    /// Add a header whose value comes from the call context.
    pub fn context_header(mut self, name: impl Into<String>, key: ContextKey) -> Self {
        self.context_headers.insert(name.into(), key);
        self
    }

    /// Check whether any header is configured.
    pub fn is_empty(&self) -> bool {
        self.static_headers.is_empty() && self.context_headers.is_empty()
    }

    /// Validate names and static values.
    pub(crate) fn compile(&self) -> std::result::Result<HeaderInjectionStage, ConfigError> {
        let mut static_headers = Vec::with_capacity(self.static_headers.len());
        for (name, value) in &self.static_headers {
            let header = parse_name(name)?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| ConfigError::InvalidHeaderValue { name: name.clone() })?;
            static_headers.push((header, value));
        }

        let mut context_headers = Vec::with_capacity(self.context_headers.len());
        for (name, key) in &self.context_headers {
            context_headers.push((parse_name(name)?, key.clone()));
        }

        Ok(HeaderInjectionStage {
            static_headers,
            context_headers,
        })
    }
}

fn parse_name(name: &str) -> std::result::Result<HeaderName, ConfigError> {
    HeaderName::try_from(name).map_err(|_| ConfigError::InvalidHeaderName(name.to_string()))
}

/// Stage that fills in configured headers where the request lacks them.
///
/// Headers already present on the request always win over both static and
/// context-derived values.
#[derive(Debug, Clone)]
pub struct HeaderInjectionStage {
    static_headers: Vec<(HeaderName, HeaderValue)>,
    context_headers: Vec<(HeaderName, ContextKey)>,
}

impl HeaderInjectionStage {
    /// Build a stage from settings, validating every header.
    pub fn new(settings: &HeaderSettings) -> std::result::Result<Self, ConfigError> {
        settings.compile()
    }

    fn apply(&self, request: &mut Request) {
        let values = request.context().values().clone();
        let headers = request.headers_mut();

        for (name, value) in &self.static_headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        for (name, key) in &self.context_headers {
            if headers.contains_key(name) {
                continue;
            }
            let Some(rendered) = values.get_string(key) else {
                continue;
            };
            match HeaderValue::try_from(rendered) {
                Ok(value) => {
                    headers.insert(name.clone(), value);
                }
                Err(_) => {
                    warn!(header = %name, key = %key, "Context value is not a valid header value, skipping");
                }
            }
        }
    }
}

#[async_trait]
impl Stage for HeaderInjectionStage {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response> {
        self.apply(&mut request);
        next.run(request).await
    }

    fn name(&self) -> &'static str {
        "headers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallContext, Chain, Transport};
    use http::{HeaderMap, Method, StatusCode};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const REQUEST_ID: ContextKey = ContextKey::from_static("request-id");
    const USER_ID: ContextKey = ContextKey::from_static("user-id");

    #[derive(Default)]
    struct Capture(Mutex<Option<HeaderMap>>);

    #[async_trait]
    impl Transport for Capture {
        async fn send(&self, request: Request) -> Result<Response> {
            *self.0.lock() = Some(request.headers().clone());
            Ok(Response::from_parts(StatusCode::OK, HeaderMap::new(), ""))
        }
    }

    async fn send_through(settings: HeaderSettings, request: Request) -> HeaderMap {
        let capture = Arc::new(Capture::default());
        let chain = Chain::new(capture.clone()).wrap(HeaderInjectionStage::new(&settings).unwrap());
        chain.execute(request).await.unwrap();
        let headers = capture.0.lock().take();
        headers.unwrap()
    }

    fn get() -> Request {
        Request::new(Method::GET, "http://example.com".parse().unwrap())
    }

    #[tokio::test]
    async fn test_static_header_added_when_absent() {
        let settings = HeaderSettings::new().static_header("X-API-Key", "secret");
        let headers = send_through(settings, get()).await;
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_existing_header_is_never_overwritten() {
        let settings = HeaderSettings::new()
            .static_header("X-API-Key", "secret")
            .context_header("X-Request-ID", REQUEST_ID);

        let mut request = get().with_context(CallContext::new().with_value(REQUEST_ID, "from-context"));
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("override"));
        request
            .headers_mut()
            .insert("x-request-id", HeaderValue::from_static("explicit"));

        let headers = send_through(settings, request).await;
        assert_eq!(headers.get("x-api-key").unwrap(), "override");
        assert_eq!(headers.get("x-request-id").unwrap(), "explicit");
        assert_eq!(headers.get_all("x-api-key").iter().count(), 1);
    }

    #[tokio::test]
    async fn test_context_values_are_rendered() {
        let settings = HeaderSettings::new()
            .context_header("X-Request-ID", REQUEST_ID)
            .context_header("X-User-ID", USER_ID);

        let request = get().with_context(
            CallContext::new()
                .with_value(REQUEST_ID, "req-12345")
                .with_value(USER_ID, 42u32),
        );
        let headers = send_through(settings, request).await;
        assert_eq!(headers.get("x-request-id").unwrap(), "req-12345");
        assert_eq!(headers.get("x-user-id").unwrap(), "42");
    }

    #[tokio::test]
    async fn test_missing_or_invalid_context_values_are_omitted() {
        let settings = HeaderSettings::new()
            .context_header("X-Request-ID", REQUEST_ID)
            .context_header("X-User-ID", USER_ID);

        let request = get().with_context(CallContext::new().with_value(USER_ID, "line\nbreak"));
        let headers = send_through(settings, request).await;
        assert!(headers.get("x-request-id").is_none());
        assert!(headers.get("x-user-id").is_none());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let bad_name = HeaderSettings::new().static_header("bad header", "v");
        assert_eq!(
            HeaderInjectionStage::new(&bad_name).unwrap_err(),
            ConfigError::InvalidHeaderName("bad header".into())
        );

        let bad_value = HeaderSettings::new().static_header("X-Key", "a\r\nb");
        assert_eq!(
            HeaderInjectionStage::new(&bad_value).unwrap_err(),
            ConfigError::InvalidHeaderValue { name: "X-Key".into() }
        );

        let bad_context = HeaderSettings::new().context_header("", REQUEST_ID);
        assert!(HeaderInjectionStage::new(&bad_context).is_err());
    }
}
