//! Proxy Server Module
//!
//! The inbound hyper server: admin endpoints, the embedded web UI, and the
//! `/v2/` proxy path driven through the director and the middleware pipeline.

use crate::cache_manager::CacheManager;
use crate::config::Config;
use crate::executor::UpstreamExecutor;
use crate::middleware_auth::AuthMiddleware;
use crate::middleware_cache::CacheMiddleware;
use crate::pipeline::{full_body, Pipeline, ProxyBody};
use crate::router;
use crate::shutdown::ShutdownSignal;
use crate::web_assets;
use crate::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Hop-by-hop headers that must not be forwarded to the client.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

pub struct ProxyServer {
    config: Arc<Config>,
    cache_manager: Arc<CacheManager>,
    pipeline: Pipeline,
}

impl ProxyServer {
    pub fn new(config: Arc<Config>) -> Self {
        let cache_manager = Arc::new(CacheManager::new(config.clone()));
        let executor = Arc::new(UpstreamExecutor::new(config.clone()));

        let pipeline = Pipeline::new(executor.clone())
            .with(Arc::new(CacheMiddleware::new(cache_manager.clone())))
            .with(Arc::new(AuthMiddleware::new(config.clone(), executor)));

        Self {
            config,
            cache_manager,
            pipeline,
        }
    }

    pub fn cache_manager(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache_manager)
    }

    /// Accept loop. Each connection is served on its own task until the
    /// shutdown signal fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        info!("proxy listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, _) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                            continue;
                        }
                    };

                    let io = TokioIo::new(stream);
                    let server = Arc::clone(&self);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { Ok::<_, Infallible>(server.handle(req).await) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("error serving connection: {e}");
                        }
                    });
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("proxy server received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        info!("request: method={} path={}", req.method(), req.uri().path());

        let path = req.uri().path().to_string();
        match path.as_str() {
            "/_/health" => json_response(StatusCode::OK, r#"{"status":"healthy"}"#.to_string()),
            "/_/stats" => {
                if !self.config.auth.is_authenticated(&req) {
                    return unauthorized();
                }
                match serde_json::to_string(&self.cache_manager.stats()) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => {
                        error!("failed to serialize stats: {e}");
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    }
                }
            }
            _ => {
                if req.method() == Method::GET || req.method() == Method::HEAD {
                    if let Some(asset) = web_assets::lookup(&path) {
                        return asset_response(&asset);
                    }
                }

                if !self.config.auth.is_authenticated(&req) {
                    return unauthorized();
                }
                if self.config.whitelist_mode && !router::registry_allowed(&path, &self.config) {
                    return text_response(StatusCode::FORBIDDEN, "Registry not allowed");
                }

                self.proxy_request(req).await
            }
        }
    }

    async fn proxy_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("failed to read request body: {e}");
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let mut upstream_req = Request::from_parts(parts, body);
        if let Err(e) = router::rewrite_request(&mut upstream_req, &self.config) {
            error!("failed to rewrite request: {e}");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
        let upstream_url = upstream_req.uri().to_string();

        match self.pipeline.execute(upstream_req).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                strip_hop_headers(&mut parts.headers);
                Response::from_parts(parts, body)
            }
            Err(e) => {
                debug!("proxy error: url={upstream_url} error={e}");
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

fn asset_response(asset: &web_assets::StaticAsset) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(asset.body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(asset.content_type));
    resp
}

fn unauthorized() -> Response<ProxyBody> {
    let mut resp = text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    resp.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="OCI-Proxy""#),
    );
    resp
}
