//! OCI Proxy - Caching reverse proxy for OCI/Docker container registries
//!
//! Clients direct image pulls at the proxy; each request is rewritten to the
//! appropriate upstream registry, anonymous bearer tokens are negotiated
//! transparently, and content-addressed blobs are cached on local disk so
//! repeat pulls never touch the upstream.

pub mod blob_cache;
pub mod cache_manager;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod middleware_auth;
pub mod middleware_cache;
pub mod pipeline;
pub mod proxy;
pub mod router;
pub mod shutdown;
pub mod tee_stream;
pub mod web_assets;

pub use error::{ProxyError, Result};
