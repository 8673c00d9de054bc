//! Stage chain for the outbound pipeline.
//!
//! A [`Chain`] is an ordered list of [`Stage`]s in front of a terminal
//! [`Transport`]. Stages are stored outermost first; each stage receives a
//! [`Next`] handle that runs the remainder of the chain and may call it any
//! number of times (the retry stage calls it once per attempt).

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::{Request, Response, Result};

/// Terminal leaf of the pipeline: performs one network exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return its response.
    async fn send(&self, request: Request) -> Result<Response>;
}

/// A decorator around the rest of the chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Process the request, delegating to `next` as needed.
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response>;

    /// Short stage name used in logs and for inspecting chain order.
    fn name(&self) -> &'static str;
}

/// The remainder of a chain, as seen from inside a stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a dyn Transport,
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    /// Run the remaining stages and the transport.
    pub async fn run(self, request: Request) -> Result<Response> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    transport: self.transport,
                    stages: rest,
                };
                stage.handle(request, next).await
            }
            None => self.transport.send(request).await,
        }
    }
}

/// Ordered stages in front of a transport.
#[derive(Clone)]
pub struct Chain {
    transport: Arc<dyn Transport>,
    stages: Vec<Arc<dyn Stage>>,
}

impl Chain {
    /// Create a chain with no stages.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            stages: Vec::new(),
        }
    }

    /// Wrap the current chain in another stage.
    ///
    /// The stage added last is the outermost one and sees each request first.
    pub fn wrap<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.insert(0, Arc::new(stage));
        self
    }

    /// Stage names, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Execute a request through every stage.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let next = Next {
            transport: self.transport.as_ref(),
            stages: &self.stages,
        };
        next.run(request).await
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, request: Request) -> Result<Response> {
            let mut seen = Vec::new();
            for value in request.headers().get_all("x-trail") {
                seen.push(value.to_str().unwrap_or_default().to_string());
            }
            self.0.lock().push(seen.join(","));
            Ok(Response::from_parts(StatusCode::OK, HeaderMap::new(), ""))
        }
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Stage for Tag {
        async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response> {
            request
                .headers_mut()
                .append("x-trail", HeaderValue::from_static(self.0));
            next.run(request).await
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_last_wrapped_stage_runs_first() {
        let transport = Arc::new(Recorder(Mutex::new(Vec::new())));
        let chain = Chain::new(transport.clone())
            .wrap(Tag("inner"))
            .wrap(Tag("outer"));

        assert_eq!(chain.stage_names(), vec!["outer", "inner"]);

        let request = Request::new(Method::GET, "http://example.com".parse().unwrap());
        let response = chain.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.0.lock().as_slice(), ["outer,inner"]);
    }

    #[tokio::test]
    async fn test_empty_chain_goes_straight_to_transport() {
        let transport = Arc::new(Recorder(Mutex::new(Vec::new())));
        let chain = Chain::new(transport.clone());
        assert!(chain.stage_names().is_empty());

        let request = Request::new(Method::GET, "http://example.com".parse().unwrap());
        chain.execute(request).await.unwrap();
        assert_eq!(transport.0.lock().len(), 1);
    }
}
