//! Blob Cache Module
//!
//! LRU cache of content-addressed blob files on disk. Each entry is a regular
//! file named by its digest inside the cache directory; the recency order is
//! persisted to a `.lru_persistence` file so it survives restarts.

use crate::{ProxyError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PERSISTENCE_FILE: &str = ".lru_persistence";

/// One cached blob. Serialized one-per-line into the persistence file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEntry {
    pub key: String,
    pub size: i64,
    pub last_access: DateTime<Utc>,
}

/// Snapshot of cache usage counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheStats {
    pub hits: i64,
    pub misses: i64,
    pub evictions: i64,
    pub items: usize,
    pub current_size: i64,
    pub max_size: i64,
}

/// Disk-backed LRU cache for one upstream registry.
///
/// The index and recency order live in an in-memory [`LruCache`] guarded by a
/// mutex that is never held across an await point; file opens, temp writes,
/// hashing and renames all happen outside it. Counters are atomics so the hot
/// path does not take the lock for bookkeeping.
///
/// A cache constructed without a directory (the substitute when directory
/// creation fails) accepts writes by draining them and never hits.
pub struct BlobCache {
    max_size: i64,
    cache_dir: Option<PathBuf>,
    index: Mutex<LruCache<String, BlobEntry>>,
    size: AtomicI64,
    hits: AtomicI64,
    misses: AtomicI64,
    evictions: AtomicI64,
    dirty: AtomicBool,
    /// Serializes persistence writes; the index mutex is only taken for the
    /// snapshot.
    persist_lock: tokio::sync::Mutex<()>,
}

impl BlobCache {
    /// Create a cache over `cache_dir`, creating the directory if needed and
    /// replaying the persistence file. `max_size <= 0` disables eviction.
    pub fn new(max_size: i64, cache_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &cache_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                ProxyError::CacheError(format!(
                    "failed to create cache directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let cache = Self {
            max_size,
            cache_dir,
            index: Mutex::new(LruCache::unbounded()),
            size: AtomicI64::new(0),
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            evictions: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        };

        if let Err(e) = cache.load() {
            warn!("could not load cache persistence, starting fresh: {e}");
        }

        Ok(cache)
    }

    /// A cache with no backing directory: writes are drained and discarded,
    /// reads always miss. Substituted when a real cache cannot be built so
    /// requests keep flowing uncached.
    pub fn disabled() -> Self {
        Self {
            max_size: 0,
            cache_dir: None,
            index: Mutex::new(LruCache::unbounded()),
            size: AtomicI64::new(0),
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            evictions: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Look up a blob. On a hit the entry is promoted, its access time is
    /// stamped, and an open handle plus the recorded size is returned. An
    /// index entry whose file has gone missing is evicted and reported as a
    /// miss.
    pub async fn get_reader(&self, key: &str) -> Option<(File, i64)> {
        let dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let size = {
            let mut index = self.index.lock().unwrap();
            match index.get_mut(key) {
                Some(entry) => {
                    entry.last_access = Utc::now();
                    entry.size
                }
                None => {
                    drop(index);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        match File::open(dir.join(key)).await {
            Ok(file) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.dirty.store(true, Ordering::Relaxed);
                Some((file, size))
            }
            Err(e) => {
                warn!("blob in index but not readable on disk, removing: key={key} error={e}");
                {
                    let mut index = self.index.lock().unwrap();
                    if let Some(entry) = index.pop(key) {
                        self.size.fetch_sub(entry.size, Ordering::Relaxed);
                    }
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stream a blob into the cache. Chunks are drained from `rx` into a
    /// fresh temp file while being hashed; the file only reaches its final
    /// name if the SHA-256 digest equals `expected_digest` and the blob fits
    /// under `max_size`. A short stream (client gone before EOF) fails the
    /// digest check and leaves the cache untouched.
    pub async fn put(
        &self,
        key: &str,
        mut rx: mpsc::Receiver<Bytes>,
        expected_digest: &str,
    ) -> Result<()> {
        let dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => {
                while rx.recv().await.is_some() {}
                return Ok(());
            }
        };

        let tmp_path = dir.join(format!("blob-{}.tmp", Uuid::new_v4()));
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|e| ProxyError::CacheError(format!("failed to create temp file: {e}")))?;

        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut result = Ok(());

        while let Some(chunk) = rx.recv().await {
            hasher.update(&chunk);
            size += chunk.len() as i64;
            if let Err(e) = tmp.write_all(&chunk).await {
                result = Err(ProxyError::CacheError(format!(
                    "failed to write to temp file: {e}"
                )));
                break;
            }
        }

        if result.is_ok() {
            result = tmp
                .sync_all()
                .await
                .map_err(|e| ProxyError::CacheError(format!("failed to sync temp file: {e}")));
        }
        drop(tmp);

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let actual_digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual_digest != expected_digest {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ProxyError::DigestMismatch {
                expected: expected_digest.to_string(),
                actual: actual_digest,
            });
        }

        if self.max_size > 0 && size > self.max_size {
            warn!(
                "blob exceeds max cache size, skipping: key={key} size={size} max_size={}",
                self.max_size
            );
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Ok(());
        }

        tokio::fs::rename(&tmp_path, dir.join(key))
            .await
            .map_err(|e| ProxyError::CacheError(format!("failed to move cached file: {e}")))?;

        let victims = {
            let mut index = self.index.lock().unwrap();
            let entry = BlobEntry {
                key: key.to_string(),
                size,
                last_access: Utc::now(),
            };
            match index.put(key.to_string(), entry) {
                Some(old) => self.size.fetch_add(size - old.size, Ordering::Relaxed),
                None => self.size.fetch_add(size, Ordering::Relaxed),
            };
            self.collect_victims(&mut index)
        };
        self.dirty.store(true, Ordering::Relaxed);

        // Victim files are deleted after the index lock is released.
        self.delete_files(&dir, &victims).await;
        Ok(())
    }

    /// Buffered-variant of [`put`](Self::put), mainly for callers that already
    /// hold the whole blob.
    pub async fn put_bytes(&self, key: &str, data: &[u8], expected_digest: &str) -> Result<()> {
        let (tx, rx) = mpsc::channel(1);
        let data = Bytes::copy_from_slice(data);
        let put = self.put(key, rx, expected_digest);
        let send = async move {
            let _ = tx.send(data).await;
        };
        let (result, ()) = tokio::join!(put, send);
        result
    }

    /// Pop tail entries until the size counter is back under `max_size`.
    /// Must be called with the index lock held; returns the victims so their
    /// files can be deleted after the lock is dropped.
    fn collect_victims(&self, index: &mut LruCache<String, BlobEntry>) -> Vec<BlobEntry> {
        if self.max_size <= 0 {
            return Vec::new();
        }
        let mut victims = Vec::new();
        while self.size.load(Ordering::Relaxed) > self.max_size {
            match index.pop_lru() {
                Some((_, entry)) => {
                    self.size.fetch_sub(entry.size, Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    victims.push(entry);
                }
                None => break,
            }
        }
        victims
    }

    async fn delete_files(&self, dir: &std::path::Path, entries: &[BlobEntry]) {
        for entry in entries {
            let path = dir.join(&entry.key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("evicted cache file: key={} size={}", entry.key, entry.size),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove cache file {}: {e}", path.display()),
            }
        }
    }

    /// Remove a blob and its file. Idempotent.
    pub async fn remove(&self, key: &str) {
        let entry = {
            let mut index = self.index.lock().unwrap();
            index.pop(key)
        };
        let Some(entry) = entry else { return };
        self.size.fetch_sub(entry.size, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        if let Some(dir) = &self.cache_dir {
            self.delete_files(dir, std::slice::from_ref(&entry)).await;
        }
    }

    /// Drop every blob and reset the index. Statistics counters are kept.
    pub async fn clear(&self) {
        let entries: Vec<BlobEntry> = {
            let mut index = self.index.lock().unwrap();
            let entries = index.iter().map(|(_, e)| e.clone()).collect();
            index.clear();
            self.size.store(0, Ordering::Relaxed);
            entries
        };
        self.dirty.store(true, Ordering::Relaxed);
        if let Some(dir) = &self.cache_dir {
            self.delete_files(dir, &entries).await;
        }
    }

    /// Write the index to the persistence file (temp + rename), oldest entry
    /// first so replay rebuilds the same recency order. A clean dirty flag
    /// makes this a no-op; failures leave it set so the next attempt retries.
    pub async fn persist(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }
        let _guard = self.persist_lock.lock().await;
        let Some(dir) = self.cache_dir.clone() else {
            return Ok(());
        };
        let path = dir.join(PERSISTENCE_FILE);

        let entries: Vec<BlobEntry> = {
            let index = self.index.lock().unwrap();
            // iter() walks most-recent first; the file wants oldest first
            let mut entries: Vec<BlobEntry> = index.iter().map(|(_, e)| e.clone()).collect();
            entries.reverse();
            entries
        };

        let mut encoded = Vec::with_capacity(entries.len() * 96);
        for entry in &entries {
            serde_json::to_writer(&mut encoded, entry)
                .map_err(|e| ProxyError::PersistenceError(format!("failed to encode entry: {e}")))?;
            encoded.push(b'\n');
        }

        let tmp_path = dir.join(format!("{PERSISTENCE_FILE}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = self.write_persistence(&tmp_path, &path, &encoded).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn write_persistence(
        &self,
        tmp_path: &std::path::Path,
        final_path: &std::path::Path,
        encoded: &[u8],
    ) -> Result<()> {
        let mut file = File::create(tmp_path).await.map_err(|e| {
            ProxyError::PersistenceError(format!("failed to create temp persistence file: {e}"))
        })?;
        file.write_all(encoded)
            .await
            .map_err(|e| ProxyError::PersistenceError(format!("failed to write entries: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| ProxyError::PersistenceError(format!("failed to sync: {e}")))?;
        drop(file);
        tokio::fs::rename(tmp_path, final_path).await.map_err(|e| {
            ProxyError::PersistenceError(format!("failed to rename persistence file: {e}"))
        })
    }

    /// Replay the persistence file into the index, validating each entry
    /// against the file actually on disk. Entries with missing files are
    /// skipped; size mismatches also delete the stray file.
    fn load(&self) -> Result<()> {
        let Some(dir) = self.cache_dir.clone() else {
            return Ok(());
        };
        let path = dir.join(PERSISTENCE_FILE);

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ProxyError::PersistenceError(format!(
                    "failed to open {}: {e}",
                    path.display()
                )))
            }
        };

        let mut valid = Vec::new();
        let mut skipped = 0usize;

        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(|e| {
                ProxyError::PersistenceError(format!("failed to read persistence file: {e}"))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: BlobEntry = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed to decode cache entry, skipping: {e}");
                    skipped += 1;
                    continue;
                }
            };

            let blob_path = dir.join(&entry.key);
            match std::fs::metadata(&blob_path) {
                Ok(meta) if meta.len() as i64 == entry.size => valid.push(entry),
                Ok(meta) => {
                    warn!(
                        "cached file size mismatch, removing: key={} expected={} actual={}",
                        entry.key,
                        entry.size,
                        meta.len()
                    );
                    let _ = std::fs::remove_file(&blob_path);
                    skipped += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("file in persistence but not on disk, skipping: key={}", entry.key);
                    skipped += 1;
                }
                Err(e) => {
                    warn!("failed to stat cached file, skipping: key={} error={e}", entry.key);
                    skipped += 1;
                }
            }
        }

        let mut total = 0i64;
        {
            let mut index = self.index.lock().unwrap();
            // oldest-first on disk, so pushing each to the front restores order
            for entry in valid {
                total += entry.size;
                index.put(entry.key.clone(), entry);
            }
            self.size.fetch_add(total, Ordering::Relaxed);
            info!(
                "loaded cache from persistence: loaded={} skipped={skipped} size={total}",
                index.len()
            );
        }

        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let items = self.index.lock().unwrap().len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            items,
            current_size: self.size.load(Ordering::Relaxed),
            max_size: self.max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }
}
