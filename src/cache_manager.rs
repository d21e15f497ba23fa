//! Cache Manager Module
//!
//! Owns one [`BlobCache`] per upstream registry host, constructed lazily from
//! that host's resolved settings on first use.

use crate::blob_cache::{BlobCache, CacheStats};
use crate::config::Config;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

pub struct CacheManager {
    config: Arc<Config>,
    caches: RwLock<HashMap<String, Arc<BlobCache>>>,
}

impl CacheManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Cache for a registry host, building it on first access. Construction
    /// failure substitutes a no-op cache so requests keep flowing uncached.
    pub fn get_cache(&self, registry_host: &str) -> Arc<BlobCache> {
        if let Some(cache) = self.caches.read().unwrap().get(registry_host) {
            return Arc::clone(cache);
        }

        let mut caches = self.caches.write().unwrap();
        if let Some(cache) = caches.get(registry_host) {
            return Arc::clone(cache);
        }

        let settings = self.config.registry_settings(registry_host);
        let cache = match BlobCache::new(settings.cache_max_size.bytes(), settings.cache_dir) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                error!("failed to create cache for registry {registry_host}: {e}");
                Arc::new(BlobCache::disabled())
            }
        };

        caches.insert(registry_host.to_string(), Arc::clone(&cache));
        debug!("initialized cache for registry {registry_host}");
        cache
    }

    /// Persist every cache. The map lock is only held for the snapshot.
    pub async fn persist_all(&self) {
        let caches: Vec<Arc<BlobCache>> = {
            let caches = self.caches.read().unwrap();
            caches.values().cloned().collect()
        };
        for cache in caches {
            if let Err(e) = cache.persist().await {
                error!("failed to persist cache: {e}");
            }
        }
    }

    pub fn stats(&self) -> HashMap<String, CacheStats> {
        let caches = self.caches.read().unwrap();
        caches
            .iter()
            .map(|(host, cache)| (host.clone(), cache.stats()))
            .collect()
    }
}
