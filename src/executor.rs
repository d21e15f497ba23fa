//! Executor Module
//!
//! Terminal step of the pipeline: performs the actual upstream HTTP call.
//! Connections are built per request from the target registry's settings —
//! direct, through an HTTP(S) egress proxy (CONNECT tunnel for TLS targets,
//! absolute-form otherwise), or through a SOCKS5 proxy.

use crate::config::{Config, RegistrySettings};
use crate::middleware_auth::TokenFetcher;
use crate::pipeline::{clone_request, Executor, UpstreamRequest, UpstreamResponse};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, AUTHORIZATION, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, error, warn};

const MAX_REDIRECTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

enum Egress {
    Direct,
    HttpProxy(Uri),
    Socks5(Uri),
}

pub struct UpstreamExecutor {
    config: Arc<Config>,
    tls: TlsConnector,
}

impl UpstreamExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("failed to add native cert: {e}");
                    }
                }
            }
            Err(e) => warn!("failed to load native certs, TLS upstreams will fail: {e}"),
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    async fn send_with_redirects(
        &self,
        req: UpstreamRequest,
        settings: &RegistrySettings,
    ) -> Result<UpstreamResponse> {
        let follow = settings.follows_redirects();
        let mut req = req;

        for _ in 0..MAX_REDIRECTS {
            let method = req.method().clone();
            let uri = req.uri().clone();
            let resp = self.send_once(clone_request(&req), settings).await?;

            if !follow
                || !resp.status().is_redirection()
                || !(method == Method::GET || method == Method::HEAD)
            {
                return Ok(resp);
            }
            let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
                return Ok(resp);
            };

            let next_uri = resolve_location(&uri, location)?;
            debug!(
                "following redirect: status={} location={next_uri}",
                resp.status()
            );

            // Redirects to another host (typically a CDN serving blobs) must
            // not carry the registry's credentials.
            let host_changed = next_uri.host() != uri.host();
            *req.uri_mut() = next_uri;
            if host_changed {
                req.headers_mut().remove(AUTHORIZATION);
            }
        }

        Err(ProxyError::UpstreamError(format!(
            "stopped after {MAX_REDIRECTS} redirects"
        )))
    }

    async fn send_once(
        &self,
        req: UpstreamRequest,
        settings: &RegistrySettings,
    ) -> Result<UpstreamResponse> {
        let uri = req.uri().clone();
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::UpstreamError("request has no host".to_string()))?
            .to_string();
        let https = uri.scheme_str() != Some("http");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let egress = match settings.upstream_proxy.as_deref() {
            None => Egress::Direct,
            Some(raw) => match raw.parse::<Uri>() {
                Ok(proxy) => match proxy.scheme_str() {
                    Some("http") | Some("https") => Egress::HttpProxy(proxy),
                    Some("socks5") => Egress::Socks5(proxy),
                    other => {
                        error!("unsupported proxy scheme {other:?}, using direct connection");
                        Egress::Direct
                    }
                },
                Err(e) => {
                    error!("invalid upstream_proxy URL {raw}: {e}");
                    Egress::Direct
                }
            },
        };

        let (stream, absolute_form): (BoxedStream, bool) = match egress {
            Egress::Direct => (Box::new(self.tcp_connect(&host, port).await?), false),
            Egress::Socks5(proxy) => (Box::new(self.socks5_connect(&proxy, &host, port).await?), false),
            Egress::HttpProxy(proxy) => {
                let (proxy_host, proxy_port) = endpoint_of(&proxy, 80)?;
                let tcp = self.tcp_connect(&proxy_host, proxy_port).await?;
                if https {
                    (Box::new(self.connect_tunnel(tcp, &host, port, &proxy).await?), false)
                } else {
                    // Plain-http targets go through the proxy in absolute form.
                    (Box::new(tcp), true)
                }
            }
        };

        let stream: BoxedStream = if https {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| ProxyError::TlsError(format!("invalid server name {host}: {e}")))?;
            let tls = self.tls.connect(server_name, stream).await.map_err(|e| {
                ProxyError::TlsError(format!("TLS handshake with {host} failed: {e}"))
            })?;
            Box::new(tls)
        } else {
            stream
        };

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::UpstreamError(format!("handshake with {host} failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection closed: {e}");
            }
        });

        let (mut parts, body) = req.into_parts();
        if !absolute_form {
            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string();
            parts.uri = path_and_query.parse::<Uri>().map_err(|e| {
                ProxyError::HttpError(format!("invalid upstream path {path_and_query}: {e}"))
            })?;
        }
        parts.headers.insert(HOST, host_header(&host, port, https)?);
        let upstream_req = Request::from_parts(parts, Full::new(body));

        let resp = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| ProxyError::UpstreamError(format!("request to {host} failed: {e}")))?;

        let (parts, body) = resp.into_parts();
        Ok(Response::from_parts(
            parts,
            body.map_err(ProxyError::from).boxed(),
        ))
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                ProxyError::UpstreamError(format!("connection to {host}:{port} timed out"))
            })?
            .map_err(|e| {
                ProxyError::UpstreamError(format!("failed to connect to {host}:{port}: {e}"))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for {host}:{port}: {e}");
        }
        Ok(stream)
    }

    async fn socks5_connect(
        &self,
        proxy: &Uri,
        host: &str,
        port: u16,
    ) -> Result<Socks5Stream<TcpStream>> {
        let (proxy_host, proxy_port) = endpoint_of(proxy, 1080)?;
        let target = (host, port);

        let connect = async {
            match userinfo_of(proxy) {
                Some((user, pass)) => {
                    Socks5Stream::connect_with_password(
                        (proxy_host.as_str(), proxy_port),
                        target,
                        &user,
                        &pass,
                    )
                    .await
                }
                None => Socks5Stream::connect((proxy_host.as_str(), proxy_port), target).await,
            }
        };

        timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                ProxyError::UpstreamError(format!(
                    "SOCKS5 connection via {proxy_host}:{proxy_port} timed out"
                ))
            })?
            .map_err(|e| ProxyError::UpstreamError(format!("SOCKS5 connect failed: {e}")))
    }

    /// Open a CONNECT tunnel to `host:port` through an already-connected HTTP
    /// proxy socket.
    async fn connect_tunnel(
        &self,
        mut tcp: TcpStream,
        host: &str,
        port: u16,
        proxy: &Uri,
    ) -> Result<TcpStream> {
        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some((user, pass)) = userinfo_of(proxy) {
            let credentials = BASE64.encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");

        tcp.write_all(request.as_bytes())
            .await
            .map_err(|e| ProxyError::UpstreamError(format!("proxy CONNECT write failed: {e}")))?;

        // The proxy sends nothing after its response headers until we start
        // the tunnel, so reading up to the blank line cannot eat TLS bytes.
        let mut response = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        loop {
            let n = timeout(CONNECT_TIMEOUT, tcp.read(&mut buf))
                .await
                .map_err(|_| {
                    ProxyError::UpstreamError("proxy CONNECT response timed out".to_string())
                })?
                .map_err(|e| {
                    ProxyError::UpstreamError(format!("proxy CONNECT read failed: {e}"))
                })?;
            if n == 0 {
                return Err(ProxyError::UpstreamError(
                    "proxy closed connection during CONNECT".to_string(),
                ));
            }
            response.extend_from_slice(&buf[..n]);
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if response.len() > 8192 {
                return Err(ProxyError::UpstreamError(
                    "proxy CONNECT response too large".to_string(),
                ));
            }
        }

        let status_line = String::from_utf8_lossy(&response);
        let status_line = status_line.lines().next().unwrap_or_default();
        if status_line.split_whitespace().nth(1) != Some("200") {
            return Err(ProxyError::UpstreamError(format!(
                "proxy CONNECT failed: {status_line}"
            )));
        }
        Ok(tcp)
    }
}

#[async_trait]
impl Executor for UpstreamExecutor {
    async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        let host = req.uri().host().unwrap_or_default().to_string();
        let settings = self.config.registry_settings(&host);
        debug!("executing request: url={}", req.uri());
        self.send_with_redirects(req, &settings).await
    }
}

#[async_trait]
impl TokenFetcher for UpstreamExecutor {
    /// Plain unauthenticated GET for the token endpoint, bypassing any
    /// per-registry egress proxy.
    async fn fetch(&self, url: &str) -> Result<(StatusCode, Bytes)> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ProxyError::AuthChallenge(format!("invalid token URL {url}: {e}")))?;
        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = uri;

        let resp = self
            .send_with_redirects(req, &RegistrySettings::default())
            .await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}

fn host_header(host: &str, port: u16, https: bool) -> Result<HeaderValue> {
    let value = if (https && port != 443) || (!https && port != 80) {
        format!("{host}:{port}")
    } else {
        host.to_string()
    };
    HeaderValue::from_str(&value)
        .map_err(|e| ProxyError::HttpError(format!("invalid host header {value}: {e}")))
}

fn endpoint_of(uri: &Uri, default_port: u16) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::ConfigError(format!("proxy URL {uri} has no host")))?;
    Ok((host.to_string(), uri.port_u16().unwrap_or(default_port)))
}

/// Credentials from a proxy URL's userinfo component, if any.
fn userinfo_of(uri: &Uri) -> Option<(String, String)> {
    let authority = uri.authority()?.as_str();
    let (userinfo, _) = authority.rsplit_once('@')?;
    match userinfo.split_once(':') {
        Some((user, pass)) => Some((user.to_string(), pass.to_string())),
        None => Some((userinfo.to_string(), String::new())),
    }
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location
            .parse()
            .map_err(|e| ProxyError::UpstreamError(format!("invalid redirect {location}: {e}")));
    }

    let scheme = base.scheme_str().unwrap_or("https");
    let authority = base
        .authority()
        .ok_or_else(|| ProxyError::UpstreamError("redirect from relative base".to_string()))?;
    let path_and_query = if location.starts_with('/') {
        location.to_string()
    } else {
        let base_path = base.path();
        let dir_end = base_path.rfind('/').map(|i| i + 1).unwrap_or(0);
        format!("{}{location}", &base_path[..dir_end])
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::UpstreamError(format!("invalid redirect {location}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_redirect_locations() {
        let base: Uri = "https://ghcr.io/v2/owner/img/blobs/sha256:abc"
            .parse()
            .unwrap();

        let absolute = resolve_location(&base, "https://cdn.example/blob?sig=1").unwrap();
        assert_eq!(absolute.host(), Some("cdn.example"));
        assert_eq!(absolute.query(), Some("sig=1"));

        let rooted = resolve_location(&base, "/elsewhere/blob").unwrap();
        assert_eq!(rooted.host(), Some("ghcr.io"));
        assert_eq!(rooted.path(), "/elsewhere/blob");

        let relative = resolve_location(&base, "nearby").unwrap();
        assert_eq!(relative.path(), "/v2/owner/img/blobs/nearby");
    }

    #[test]
    fn extracts_proxy_endpoint_and_credentials() {
        let plain: Uri = "http://proxy.internal:3128".parse().unwrap();
        assert_eq!(endpoint_of(&plain, 80).unwrap(), ("proxy.internal".to_string(), 3128));
        assert!(userinfo_of(&plain).is_none());

        let with_auth: Uri = "socks5://user:pw@egress.example".parse().unwrap();
        assert_eq!(endpoint_of(&with_auth, 1080).unwrap().1, 1080);
        assert_eq!(
            userinfo_of(&with_auth).unwrap(),
            ("user".to_string(), "pw".to_string())
        );
    }

    #[test]
    fn host_header_includes_nonstandard_ports() {
        assert_eq!(host_header("ghcr.io", 443, true).unwrap(), "ghcr.io");
        assert_eq!(host_header("ghcr.io", 8443, true).unwrap(), "ghcr.io:8443");
        assert_eq!(host_header("reg.local", 80, false).unwrap(), "reg.local");
        assert_eq!(host_header("reg.local", 5000, false).unwrap(), "reg.local:5000");
    }
}
