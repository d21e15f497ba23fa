//! Middleware Pipeline Module
//!
//! An ordered chain of interceptors terminating at an executor. The pipeline
//! is the proxy's round-tripper: the caching and auth middlewares wrap each
//! upstream call without ever buffering response bodies.

use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use std::sync::Arc;

/// Streaming response body shared across middlewares and the server.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

/// Requests travel through the pipeline fully buffered (pulls carry no
/// payload), with an absolute URI produced by the router.
pub type UpstreamRequest = Request<Bytes>;
pub type UpstreamResponse = Response<ProxyBody>;

/// Box a buffered payload as a [`ProxyBody`].
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Duplicate a request envelope and its buffered body.
pub fn clone_request(req: &UpstreamRequest) -> UpstreamRequest {
    let mut clone = Request::new(req.body().clone());
    *clone.method_mut() = req.method().clone();
    *clone.uri_mut() = req.uri().clone();
    *clone.version_mut() = req.version();
    *clone.headers_mut() = req.headers().clone();
    clone
}

/// A request interceptor. Implementations may short-circuit (never calling
/// `next`), decorate the response, or re-drive the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, req: UpstreamRequest, next: Next<'_>) -> Result<UpstreamResponse>;
}

/// Terminal step of the pipeline: performs the actual upstream HTTP call.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// Continuation over the rest of the chain. `Copy` so a middleware can drive
/// the tail more than once (the auth middleware retries after a challenge).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    executor: &'a dyn Executor,
}

impl<'a> Next<'a> {
    pub async fn run(self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    rest,
                    executor: self.executor,
                };
                middleware.process(req, next).await
            }
            None => self.executor.execute(req).await,
        }
    }
}

/// Ordered middleware chain plus terminal executor. Middlewares run in the
/// order they were added.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    executor: Arc<dyn Executor>,
}

impl Pipeline {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            middlewares: Vec::new(),
            executor,
        }
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        let next = Next {
            rest: &self.middlewares,
            executor: &*self.executor,
        };
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn process(&self, req: UpstreamRequest, next: Next<'_>) -> Result<UpstreamResponse> {
            self.order.lock().unwrap().push(self.label);
            next.run(req).await
        }
    }

    struct StubExecutor {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, _req: UpstreamRequest) -> Result<UpstreamResponse> {
            self.order.lock().unwrap().push("executor");
            let mut resp = Response::new(empty_body());
            *resp.status_mut() = StatusCode::OK;
            Ok(resp)
        }
    }

    #[tokio::test]
    async fn middlewares_run_in_declaration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Arc::new(StubExecutor {
            order: order.clone(),
        }))
        .with(Arc::new(Recorder {
            label: "first",
            order: order.clone(),
        }))
        .with(Arc::new(Recorder {
            label: "second",
            order: order.clone(),
        }));

        let req = Request::new(Bytes::new());
        let resp = pipeline.execute(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "executor"]);
    }

    #[tokio::test]
    async fn empty_pipeline_reaches_executor() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Arc::new(StubExecutor {
            order: order.clone(),
        }));
        pipeline.execute(Request::new(Bytes::new())).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["executor"]);
    }
}
