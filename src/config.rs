//! Configuration Module
//!
//! Loads the YAML configuration file and resolves per-registry settings by
//! merging host-specific overrides over the `defaults` block.

use crate::{ProxyError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::Request;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A byte count parsed from either a bare integer or a human-readable size
/// string (`1g`, `500m`, `1024k`, `1t`, base 1024, optional trailing `b`).
///
/// A value of zero or below means "unlimited" wherever a size bounds a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct StorageSize(pub i64);

impl StorageSize {
    pub fn bytes(&self) -> i64 {
        self.0
    }

    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let mut s = input.trim().to_ascii_uppercase();
        if s.is_empty() {
            return Ok(StorageSize(0));
        }
        if let Some(stripped) = s.strip_suffix('B') {
            s = stripped.to_string();
        }

        const UNITS: [(&str, i64); 4] = [
            ("T", 1024 * 1024 * 1024 * 1024),
            ("G", 1024 * 1024 * 1024),
            ("M", 1024 * 1024),
            ("K", 1024),
        ];

        for (suffix, multiplier) in UNITS {
            if let Some(value) = s.strip_suffix(suffix) {
                let parsed: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid size value: {value}"))?;
                return Ok(StorageSize((parsed * multiplier as f64) as i64));
            }
        }

        let parsed: f64 = s.parse().map_err(|_| format!("invalid size value: {s}"))?;
        Ok(StorageSize(parsed as i64))
    }
}

impl<'de> Deserialize<'de> for StorageSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SizeVisitor;

        impl<'de> serde::de::Visitor<'de> for SizeVisitor {
            type Value = StorageSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"1g\"")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<StorageSize, E> {
                Ok(StorageSize(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<StorageSize, E> {
                Ok(StorageSize(v as i64))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<StorageSize, E> {
                StorageSize::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// Basic-auth credentials, used both for the proxy's own gate and for static
/// upstream registry credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Auth {
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Check an inbound request against these credentials. Empty credentials
    /// leave the gate open.
    pub fn is_authenticated<B>(&self, req: &Request<B>) -> bool {
        if !self.is_configured() {
            return true;
        }
        let header = match req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(h) => h,
            None => return false,
        };
        let encoded = match header.strip_prefix("Basic ") {
            Some(e) => e,
            None => return false,
        };
        let decoded = match BASE64.decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
            Some(d) => d,
            None => return false,
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }

    /// Produce an `Authorization: Basic ...` header value, if configured.
    pub fn basic_header(&self) -> Option<HeaderValue> {
        if !self.is_configured() {
            return None;
        }
        let encoded = BASE64.encode(format!("{}:{}", self.username, self.password));
        HeaderValue::from_str(&format!("Basic {encoded}")).ok()
    }
}

/// Settings for one upstream registry. Unset fields inherit from the
/// top-level `defaults` block during [`Config::load`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_max_size: StorageSize,
    #[serde(default)]
    pub upstream_proxy: Option<String>,
    #[serde(default)]
    pub follow_redirects: Option<bool>,
    #[serde(default)]
    pub insecure: Option<bool>,
}

impl RegistrySettings {
    pub fn follows_redirects(&self) -> bool {
        self.follow_redirects.unwrap_or(true)
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure.unwrap_or(false)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_registry")]
    pub default_registry: String,
    /// Informational base URL shown in the web UI.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub whitelist_mode: bool,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub defaults: RegistrySettings,
    #[serde(default)]
    pub registries: HashMap<String, RegistrySettings>,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_registry() -> String {
    "registry-1.docker.io".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            default_registry: default_registry(),
            base_url: String::new(),
            whitelist_mode: false,
            auth: Auth::default(),
            defaults: RegistrySettings::default(),
            registries: HashMap::new(),
        }
    }
}

impl Config {
    /// Load and resolve the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(data)
            .map_err(|e| ProxyError::ConfigError(format!("failed to parse config: {e}")))?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill the `defaults` block's implicit values and merge it under every
    /// configured registry so lookups never need to consult two records.
    fn apply_defaults(&mut self) {
        if self.defaults.follow_redirects.is_none() {
            self.defaults.follow_redirects = Some(true);
        }
        if self.defaults.insecure.is_none() {
            self.defaults.insecure = Some(false);
        }

        for settings in self.registries.values_mut() {
            let mut merged = self.defaults.clone();
            if !settings.auth.username.is_empty() {
                merged.auth = settings.auth.clone();
            }
            if settings.cache_dir.is_some() {
                merged.cache_dir = settings.cache_dir.clone();
            }
            if settings.cache_max_size.bytes() != 0 {
                merged.cache_max_size = settings.cache_max_size;
            }
            if settings.upstream_proxy.is_some() {
                merged.upstream_proxy = settings.upstream_proxy.clone();
            }
            if settings.follow_redirects.is_some() {
                merged.follow_redirects = settings.follow_redirects;
            }
            if settings.insecure.is_some() {
                merged.insecure = settings.insecure;
            }
            *settings = merged;
        }
    }

    /// Merged settings for a registry host, falling back to `defaults` for
    /// hosts that are not explicitly configured.
    pub fn registry_settings(&self, host: &str) -> RegistrySettings {
        match self.registries.get(host) {
            Some(settings) => settings.clone(),
            None => self.defaults.clone(),
        }
    }

    /// Whitelist check: in whitelist mode only explicitly configured
    /// registries may be proxied.
    pub fn is_registry_allowed(&self, host: &str) -> bool {
        if !self.whitelist_mode {
            return true;
        }
        self.registries.contains_key(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_sizes() {
        assert_eq!(StorageSize::parse("1g").unwrap().bytes(), 1 << 30);
        assert_eq!(StorageSize::parse("500m").unwrap().bytes(), 500 << 20);
        assert_eq!(StorageSize::parse("1024k").unwrap().bytes(), 1 << 20);
        assert_eq!(StorageSize::parse("1t").unwrap().bytes(), 1 << 40);
        assert_eq!(StorageSize::parse("2GB").unwrap().bytes(), 2 << 30);
        assert_eq!(StorageSize::parse("1.5k").unwrap().bytes(), 1536);
        assert_eq!(StorageSize::parse("123").unwrap().bytes(), 123);
        assert_eq!(StorageSize::parse("").unwrap().bytes(), 0);
        assert!(StorageSize::parse("abc").is_err());
    }

    #[test]
    fn merges_registry_settings_over_defaults() {
        let yaml = r#"
port: 5000
default_registry: docker.io
defaults:
  cache_dir: /var/cache/oci
  cache_max_size: 1g
registries:
  ghcr.io:
    cache_max_size: 2g
  quay.io:
    insecure: true
"#;
        let config = Config::from_yaml(yaml).unwrap();

        let ghcr = config.registry_settings("ghcr.io");
        assert_eq!(ghcr.cache_dir.as_deref(), Some(Path::new("/var/cache/oci")));
        assert_eq!(ghcr.cache_max_size.bytes(), 2 << 30);
        assert!(ghcr.follows_redirects());
        assert!(!ghcr.is_insecure());

        let quay = config.registry_settings("quay.io");
        assert_eq!(quay.cache_max_size.bytes(), 1 << 30);
        assert!(quay.is_insecure());

        // Unconfigured hosts fall back to the resolved defaults.
        let other = config.registry_settings("example.com");
        assert_eq!(other.cache_max_size.bytes(), 1 << 30);
        assert!(other.follows_redirects());
    }

    #[test]
    fn whitelist_mode_restricts_to_configured_hosts() {
        let yaml = r#"
whitelist_mode: true
registries:
  ghcr.io: {}
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.is_registry_allowed("ghcr.io"));
        assert!(!config.is_registry_allowed("quay.io"));

        let open = Config::from_yaml("port: 5000").unwrap();
        assert!(open.is_registry_allowed("anything.example"));
    }

    #[test]
    fn basic_auth_round_trip() {
        let auth = Auth {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        let header = auth.basic_header().unwrap();
        let req = Request::builder()
            .header(AUTHORIZATION, header)
            .body(())
            .unwrap();
        assert!(auth.is_authenticated(&req));

        let bad = Request::builder()
            .header(AUTHORIZATION, "Basic bm9wZTpub3Bl")
            .body(())
            .unwrap();
        assert!(!auth.is_authenticated(&bad));

        let missing = Request::builder().body(()).unwrap();
        assert!(!auth.is_authenticated(&missing));

        // Empty credentials leave the gate open.
        assert!(Auth::default().is_authenticated(&missing));
    }
}
