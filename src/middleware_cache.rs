//! Cache Middleware Module
//!
//! Serves blob requests straight from the per-registry cache and installs a
//! streaming tee on misses so the response populates the cache while it flows
//! to the client.

use crate::blob_cache::BlobCache;
use crate::cache_manager::CacheManager;
use crate::pipeline::{Middleware, Next, ProxyBody, UpstreamRequest, UpstreamResponse};
use crate::tee_stream::TeeStream;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Frame;
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Response, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

/// Frames buffered between the client stream and the cache writer before the
/// tee gives up on caching.
const CACHE_CHANNEL_DEPTH: usize = 64;

pub struct CacheMiddleware {
    caches: Arc<CacheManager>,
}

impl CacheMiddleware {
    pub fn new(caches: Arc<CacheManager>) -> Self {
        Self { caches }
    }

    async fn try_serve_from_cache(&self, host: &str, digest: &str) -> Option<UpstreamResponse> {
        let cache = self.caches.get_cache(host);
        let (file, size) = cache.get_reader(digest).await?;

        debug!("serving blob from cache: digest={digest}");
        let stream = ReaderStream::new(file)
            .map_ok(Frame::data)
            .map_err(ProxyError::from);
        let body: ProxyBody = BodyExt::boxed(StreamBody::new(stream));

        let mut resp = Response::new(body);
        *resp.status_mut() = StatusCode::OK;
        resp.headers_mut().insert(CONTENT_LENGTH, size.into());
        Some(resp)
    }

    /// Split the response body: the client keeps streaming while a background
    /// task writes the same bytes into the cache, verified against the path
    /// digest.
    fn install_tee(
        &self,
        resp: UpstreamResponse,
        cache: Arc<BlobCache>,
        digest: String,
    ) -> UpstreamResponse {
        let (parts, body) = resp.into_parts();
        let (tx, rx) = mpsc::channel::<Bytes>(CACHE_CHANNEL_DEPTH);

        tokio::spawn(async move {
            match cache.put(&digest, rx, &digest).await {
                Ok(()) => info!("cached blob: digest={digest}"),
                Err(e) => error!("failed to cache blob {digest}: {e}"),
            }
        });

        let tee = TeeStream::new(BodyStream::new(body), tx);
        Response::from_parts(parts, BodyExt::boxed(StreamBody::new(tee)))
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn process(&self, req: UpstreamRequest, next: Next<'_>) -> Result<UpstreamResponse> {
        let blob = blob_request_digest(&req);

        if let Some((host, digest)) = &blob {
            if let Some(resp) = self.try_serve_from_cache(host, digest).await {
                return Ok(resp);
            }
        }

        let resp = next.run(req).await?;

        let Some((host, digest)) = blob else {
            return Ok(resp);
        };
        if resp.status() != StatusCode::OK {
            return Ok(resp);
        }

        let cache = self.caches.get_cache(&host);
        Ok(self.install_tee(resp, cache, digest))
    }
}

/// A blob request is a GET whose path has at least four segments with the
/// penultimate one equal to `blobs`; the digest is the final segment. Returns
/// the upstream host alongside the digest so the right per-registry cache is
/// consulted.
fn blob_request_digest(req: &UpstreamRequest) -> Option<(String, String)> {
    if req.method() != Method::GET {
        return None;
    }
    let path = req.uri().path();
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    if parts.len() < 4 || parts[parts.len() - 2] != "blobs" {
        return None;
    }
    let host = req.uri().host()?.to_string();
    Some((host, parts[parts.len() - 1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn get(uri: &str) -> UpstreamRequest {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn recognizes_blob_requests() {
        let req = get("https://ghcr.io/v2/owner/img/blobs/sha256:abc");
        let (host, digest) = blob_request_digest(&req).unwrap();
        assert_eq!(host, "ghcr.io");
        assert_eq!(digest, "sha256:abc");

        // Deep repository names still resolve the final two segments.
        let req = get("https://ghcr.io/v2/a/b/c/blobs/sha256:def");
        assert_eq!(blob_request_digest(&req).unwrap().1, "sha256:def");
    }

    #[test]
    fn ignores_manifests_short_paths_and_non_get() {
        assert!(blob_request_digest(&get("https://ghcr.io/v2/img/manifests/latest")).is_none());
        assert!(blob_request_digest(&get("https://ghcr.io/v2/blobs/sha256:abc")).is_none());

        let head = Request::builder()
            .method(Method::HEAD)
            .uri("https://ghcr.io/v2/owner/img/blobs/sha256:abc")
            .body(Bytes::new())
            .unwrap();
        assert!(blob_request_digest(&head).is_none());
    }
}
