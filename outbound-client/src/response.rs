//! HTTP response wrapper.

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use tokio::sync::OwnedSemaphorePermit;
use url::Url;

use crate::{Error, Result};

enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes>>),
}

/// HTTP response.
///
/// The body is streamed from the connection. A response that is not consumed
/// with [`bytes`](Self::bytes) or similar should be [`drain`](Self::drain)ed
/// before being dropped so its connection can go back to the pool.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    url: Option<Url>,
}

impl Response {
    /// Create a response with a buffered body.
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Buffered(body.into()),
            url: None,
        }
    }

    /// Create a response with a streamed body.
    pub fn from_stream<S>(status: StatusCode, headers: HeaderMap, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: ResponseBody::Streaming(stream.boxed()),
            url: None,
        }
    }

    /// Wrap a reqwest response. The permit, if any, is released with the body.
    pub(crate) fn from_reqwest(
        response: reqwest::Response,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let stream = response.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(Error::from)
        });

        Self {
            status,
            headers,
            body: ResponseBody::Streaming(stream.boxed()),
            url: Some(url),
        }
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the response was successful (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response was a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response was a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the final URL, when the response came from the network.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Read the body as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(Error::Decode)
    }

    /// Read the body as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Json(e.to_string()))
    }

    /// Read and discard the rest of the body, releasing the connection.
    pub async fn drain(self) -> Result<()> {
        if let ResponseBody::Streaming(mut stream) = self.body {
            while let Some(chunk) = stream.next().await {
                chunk?;
            }
        }
        Ok(())
    }

    /// Turn a 4xx or 5xx response into an error, draining its body.
    pub async fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            let status = self.status;
            if let Err(e) = self.drain().await {
                tracing::debug!(error = %e, "Failed to drain error response body");
            }
            Err(Error::Status(status))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
