//! Auth Middleware Module
//!
//! Attaches upstream credentials to outbound requests and recovers from
//! bearer-token challenges by fetching an anonymous token and retrying once.
//! Tokens are cached in memory per `(host, scope)` with their advertised
//! expiry.

use crate::config::Config;
use crate::pipeline::{clone_request, Middleware, Next, UpstreamRequest, UpstreamResponse};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hyper::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Fallback token lifetime when the endpoint omits or zeroes `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 60;

/// Issues the anonymous `GET` against the token realm. The upstream executor
/// implements this; tests substitute a stub.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(StatusCode, Bytes)>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

pub struct AuthMiddleware {
    config: Arc<Config>,
    fetcher: Arc<dyn TokenFetcher>,
    token_cache: DashMap<String, CachedToken>,
}

impl AuthMiddleware {
    pub fn new(config: Arc<Config>, fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            config,
            fetcher,
            token_cache: DashMap::new(),
        }
    }

    /// Static registry credentials win; otherwise a cached, unexpired bearer
    /// token for the request's scope is attached. Expired entries are dropped
    /// when observed.
    fn apply_auth(&self, mut req: UpstreamRequest) -> UpstreamRequest {
        let host = req.uri().host().unwrap_or_default().to_string();
        let settings = self.config.registry_settings(&host);
        if settings.auth.is_configured() {
            if let Some(value) = settings.auth.basic_header() {
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            return req;
        }

        let scope = scope_from_path(req.uri().path());
        if scope.is_empty() {
            return req;
        }

        let key = format!("{host}::{scope}");
        let token = match self.token_cache.get(&key) {
            Some(cached) if cached.expires_at > Instant::now() => cached.token.clone(),
            Some(cached) => {
                drop(cached);
                self.token_cache.remove(&key);
                return req;
            }
            None => return req,
        };

        debug!("using cached token: key={key}");
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        req
    }

    /// On `401`/`403` with a bearer challenge, fetch an anonymous token and
    /// re-drive the chain once. Any failure surfaces the original response
    /// unchanged.
    async fn handle_challenge(
        &self,
        retry_req: UpstreamRequest,
        resp: UpstreamResponse,
        next: Next<'_>,
    ) -> Result<UpstreamResponse> {
        if resp.status() != StatusCode::UNAUTHORIZED && resp.status() != StatusCode::FORBIDDEN {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !challenge.to_ascii_lowercase().starts_with("bearer ") {
            return Ok(resp);
        }

        let host = retry_req.uri().host().unwrap_or_default().to_string();
        debug!(
            "attempting anonymous authentication: status={} registry={host}",
            resp.status()
        );

        let params = parse_challenge(&challenge);
        match self.fetch_token(&host, &params).await {
            Ok(token) => {
                drop(resp);
                let mut retry = retry_req;
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    retry.headers_mut().insert(AUTHORIZATION, value);
                }
                next.run(retry).await
            }
            Err(e) => {
                error!("anonymous authentication failed: registry={host} error={e}");
                Ok(resp)
            }
        }
    }

    async fn fetch_token(&self, host: &str, params: &HashMap<String, String>) -> Result<String> {
        let realm = params.get("realm").ok_or_else(|| {
            ProxyError::AuthChallenge("missing realm in WWW-Authenticate header".to_string())
        })?;
        let service = params.get("service").map(String::as_str).unwrap_or_default();
        let scope = params.get("scope").map(String::as_str).unwrap_or_default();

        let mut url = format!("{realm}?service={service}");
        if !scope.is_empty() {
            url.push_str("&scope=");
            url.push_str(scope);
        }

        debug!("fetching anonymous token: url={url}");
        let (status, body) = self.fetcher.fetch(&url).await?;
        if status != StatusCode::OK {
            return Err(ProxyError::AuthChallenge(format!(
                "token request failed with status {status}"
            )));
        }

        let token_resp: TokenResponse = serde_json::from_slice(&body)?;
        let token = if !token_resp.token.is_empty() {
            token_resp.token
        } else if !token_resp.access_token.is_empty() {
            token_resp.access_token
        } else {
            return Err(ProxyError::AuthChallenge(
                "token not found in response".to_string(),
            ));
        };

        let mut expires_in = token_resp.expires_in;
        if expires_in == 0 {
            expires_in = DEFAULT_TOKEN_TTL_SECS;
        }

        let key = format!("{host}::{scope}");
        self.token_cache.insert(
            key.clone(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expires_in),
            },
        );
        debug!("stored token in cache: key={key} expires_in={expires_in}");
        Ok(token)
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn process(&self, req: UpstreamRequest, next: Next<'_>) -> Result<UpstreamResponse> {
        let outbound = self.apply_auth(req);
        let retry_template = clone_request(&outbound);
        let resp = next.run(outbound).await?;
        self.handle_challenge(retry_template, resp, next).await
    }
}

/// `repository:<name>:pull` for paths of the form
/// `/v2/<name…>/{manifests,blobs}/<ref>`; other paths carry no scope and skip
/// token handling.
fn scope_from_path(path: &str) -> String {
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    if parts.len() >= 3 && parts[0] == "v2" {
        let kind = parts[parts.len() - 2];
        let repo = parts[1..parts.len() - 2].join("/");
        if !repo.is_empty() && (kind == "manifests" || kind == "blobs") {
            return format!("repository:{repo}:pull");
        }
    }
    String::new()
}

/// Parse the challenge parameters after the `Bearer ` prefix: comma-separated
/// `key=value` pairs, keys lowercased, surrounding quotes stripped from
/// values.
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let rest = header.get("bearer ".len()..).unwrap_or_default();
    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}
