//! Tracing instrumentation stage.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::{Next, Request, Response, Result, Stage};

/// Stage that wraps each attempt in an `outbound.request` span.
///
/// Status and elapsed time are logged at debug level; failures at warn.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationStage {
    log_headers: bool,
}

impl InstrumentationStage {
    /// Create a new instrumentation stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log request and response headers at trace level.
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

#[async_trait]
impl Stage for InstrumentationStage {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response> {
        let span = info_span!(
            "outbound.request",
            method = %request.method(),
            url = %request.url(),
        );

        async move {
            if self.log_headers {
                for (name, value) in request.headers() {
                    trace!(header = %name, value = ?value, "Request header");
                }
            }

            let start = Instant::now();
            let outcome = next.run(request).await;
            let elapsed = start.elapsed();

            match &outcome {
                Ok(response) => {
                    debug!(status = %response.status(), ?elapsed, "Received HTTP response");
                    if self.log_headers {
                        for (name, value) in response.headers() {
                            trace!(header = %name, value = ?value, "Response header");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, ?elapsed, "HTTP request failed");
                }
            }

            outcome
        }
        .instrument(span)
        .await
    }

    fn name(&self) -> &'static str {
        "instrumentation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chain, Error, Transport};
    use http::{HeaderMap, Method, StatusCode};
    use std::sync::Arc;

    struct Outcome(Option<StatusCode>);

    #[async_trait]
    impl Transport for Outcome {
        async fn send(&self, _request: Request) -> Result<Response> {
            match self.0 {
                Some(status) => Ok(Response::from_parts(status, HeaderMap::new(), "ok")),
                None => Err(Error::Connection("connection reset".into())),
            }
        }
    }

    fn request() -> Request {
        Request::new(Method::GET, "http://example.com/health".parse().unwrap())
    }

    #[tokio::test]
    async fn test_passes_response_through() {
        let chain = Chain::new(Arc::new(Outcome(Some(StatusCode::ACCEPTED))))
            .wrap(InstrumentationStage::new().with_headers());
        let response = chain.execute(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.bytes().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_passes_error_through() {
        let chain = Chain::new(Arc::new(Outcome(None))).wrap(InstrumentationStage::new());
        let err = chain.execute(request()).await.unwrap_err();
        assert!(err.is_connection());
    }
}
