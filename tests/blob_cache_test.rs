use oci_proxy::blob_cache::BlobCache;
use oci_proxy::ProxyError;
use sha2::{Digest, Sha256};
use std::path::Path;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn new_cache(dir: &Path, max_size: i64) -> BlobCache {
    BlobCache::new(max_size, Some(dir.to_path_buf())).unwrap()
}

async fn read_hit(cache: &BlobCache, key: &str) -> Option<Vec<u8>> {
    let (mut file, size) = cache.get_reader(key).await?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents.len() as i64, size);
    Some(contents)
}

/// Count blob files in the cache directory, ignoring the persistence file
/// and transient temp files.
fn blob_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with(".lru_persistence") && !name.ends_with(".tmp"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn put_then_get_returns_exact_bytes() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let data = b"abcd";
    let key = digest_of(data);
    cache.put_bytes(&key, data, &key).await.unwrap();

    assert_eq!(read_hit(&cache, &key).await.unwrap(), data);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.items, 1);
    assert_eq!(stats.current_size, 4);
    assert_eq!(blob_files(temp.path()), vec![key]);
}

#[tokio::test]
async fn get_on_absent_key_counts_a_miss() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    assert!(cache.get_reader("sha256:absent").await.is_none());
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().hits, 0);
}

#[tokio::test]
async fn digest_mismatch_leaves_cache_untouched() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let claimed = digest_of(b"abcd");
    let err = cache.put_bytes(&claimed, b"abcz", &claimed).await.unwrap_err();
    assert!(matches!(err, ProxyError::DigestMismatch { .. }));

    let stats = cache.stats();
    assert_eq!(stats.items, 0);
    assert_eq!(stats.current_size, 0);
    assert!(blob_files(temp.path()).is_empty());
}

#[tokio::test]
async fn oversized_blob_is_skipped_without_error() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 10);

    let data = b"more than ten bytes of payload";
    let key = digest_of(data);
    cache.put_bytes(&key, data, &key).await.unwrap();

    assert_eq!(cache.stats().items, 0);
    assert!(blob_files(temp.path()).is_empty());
}

#[tokio::test]
async fn evicts_least_recently_used_first() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 10);

    let (a, b, c) = (digest_of(b"aaaa"), digest_of(b"bbbb"), digest_of(b"cccc"));
    cache.put_bytes(&a, b"aaaa", &a).await.unwrap();
    cache.put_bytes(&b, b"bbbb", &b).await.unwrap();
    cache.put_bytes(&c, b"cccc", &c).await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.items, 2);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.current_size, 8);

    assert!(cache.get_reader(&a).await.is_none());
    assert!(read_hit(&cache, &b).await.is_some());
    assert!(read_hit(&cache, &c).await.is_some());

    let mut expected = vec![b.clone(), c.clone()];
    expected.sort();
    assert_eq!(blob_files(temp.path()), expected);
}

#[tokio::test]
async fn a_hit_protects_an_entry_from_eviction() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 10);

    let (a, b, c) = (digest_of(b"aaaa"), digest_of(b"bbbb"), digest_of(b"cccc"));
    cache.put_bytes(&a, b"aaaa", &a).await.unwrap();
    cache.put_bytes(&b, b"bbbb", &b).await.unwrap();

    // Touch A so B becomes the eviction candidate.
    assert!(read_hit(&cache, &a).await.is_some());
    cache.put_bytes(&c, b"cccc", &c).await.unwrap();

    assert!(read_hit(&cache, &a).await.is_some());
    assert!(cache.get_reader(&b).await.is_none());
    assert!(read_hit(&cache, &c).await.is_some());
}

#[tokio::test]
async fn zero_max_size_disables_eviction() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 0);

    for i in 0..20u8 {
        let data = vec![i; 128];
        let key = digest_of(&data);
        cache.put_bytes(&key, &data, &key).await.unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.items, 20);
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.current_size, 20 * 128);
}

#[tokio::test]
async fn persistence_round_trip_restores_entries_and_order() {
    let temp = TempDir::new().unwrap();
    let (a, b) = (digest_of(b"aaaa"), digest_of(b"bbbb"));

    {
        let cache = new_cache(temp.path(), 10);
        cache.put_bytes(&a, b"aaaa", &a).await.unwrap();
        cache.put_bytes(&b, b"bbbb", &b).await.unwrap();
        // Promote A so B is least recent at persist time.
        assert!(read_hit(&cache, &a).await.is_some());
        cache.persist().await.unwrap();
    }

    let cache = new_cache(temp.path(), 10);
    assert_eq!(cache.stats().items, 2);
    assert_eq!(cache.stats().current_size, 8);
    assert_eq!(read_hit(&cache, &a).await.unwrap(), b"aaaa");

    // The reloaded order still evicts B first.
    let c = digest_of(b"cccc");
    cache.put_bytes(&c, b"cccc", &c).await.unwrap();
    assert!(cache.get_reader(&b).await.is_none());
    assert!(read_hit(&cache, &a).await.is_some());
}

#[tokio::test]
async fn persist_is_idempotent_when_nothing_changed() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let key = digest_of(b"abcd");
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();
    cache.persist().await.unwrap();

    let path = temp.path().join(".lru_persistence");
    let first = std::fs::read(&path).unwrap();

    cache.persist().await.unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn load_skips_corrupt_lines_and_stale_entries() {
    let temp = TempDir::new().unwrap();
    let (good, stale, missing) = (digest_of(b"good"), digest_of(b"stale"), digest_of(b"gone"));

    {
        let cache = new_cache(temp.path(), 1 << 20);
        cache.put_bytes(&good, b"good", &good).await.unwrap();
        cache.put_bytes(&stale, b"stale", &stale).await.unwrap();
        cache.put_bytes(&missing, b"gone", &missing).await.unwrap();
        cache.persist().await.unwrap();
    }

    // Corrupt the persistence file, truncate one blob, delete another.
    let path = temp.path().join(".lru_persistence");
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("this is not json\n");
    std::fs::write(&path, contents).unwrap();
    std::fs::write(temp.path().join(&stale), b"st").unwrap();
    std::fs::remove_file(temp.path().join(&missing)).unwrap();

    let cache = new_cache(temp.path(), 1 << 20);
    assert_eq!(cache.stats().items, 1);
    assert_eq!(cache.stats().current_size, 4);
    assert_eq!(read_hit(&cache, &good).await.unwrap(), b"good");
    // The mismatched file was deleted during load.
    assert!(!temp.path().join(&stale).exists());
}

#[tokio::test]
async fn missing_file_heals_the_index_on_read() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let key = digest_of(b"abcd");
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();
    std::fs::remove_file(temp.path().join(&key)).unwrap();

    assert!(cache.get_reader(&key).await.is_none());
    let stats = cache.stats();
    assert_eq!(stats.items, 0);
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn remove_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let key = digest_of(b"abcd");
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();

    cache.remove(&key).await;
    assert_eq!(cache.stats().items, 0);
    assert!(!temp.path().join(&key).exists());

    // A second remove of the same key is a no-op.
    cache.remove(&key).await;
    assert_eq!(cache.stats().current_size, 0);
}

#[tokio::test]
async fn clear_drops_blobs_but_keeps_counters() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let key = digest_of(b"abcd");
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();
    assert!(read_hit(&cache, &key).await.is_some());

    cache.clear().await;
    assert_eq!(cache.stats().items, 0);
    assert_eq!(cache.stats().current_size, 0);
    assert_eq!(cache.stats().hits, 1);
    assert!(blob_files(temp.path()).is_empty());
}

#[tokio::test]
async fn re_putting_a_key_keeps_one_entry_and_a_stable_size() {
    let temp = TempDir::new().unwrap();
    let cache = new_cache(temp.path(), 1 << 20);

    let key = digest_of(b"abcd");
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();
    cache.put_bytes(&key, b"abcd", &key).await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.items, 1);
    assert_eq!(stats.current_size, 4);
    assert_eq!(blob_files(temp.path()), vec![key.clone()]);
    assert_eq!(read_hit(&cache, &key).await.unwrap(), b"abcd");
}

#[tokio::test]
async fn concurrent_puts_and_gets_keep_the_size_invariant() {
    let temp = TempDir::new().unwrap();
    let cache = std::sync::Arc::new(new_cache(temp.path(), 1 << 20));

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let data = vec![i; 64];
            let key = digest_of(&data);
            cache.put_bytes(&key, &data, &key).await.unwrap();
            assert!(cache.get_reader(&key).await.is_some());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.items, 8);
    assert_eq!(stats.current_size, 8 * 64);
    assert_eq!(blob_files(temp.path()).len(), 8);
}
