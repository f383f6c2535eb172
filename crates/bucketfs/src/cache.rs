// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Metadata and listing cache shared by everything in one filesystem instance
//!
//! Entries expire passively after their TTL and are dropped explicitly by
//! [`MetadataCache::invalidate`], which also drops the listing of every
//! enclosing directory. Nothing is shared between processes: another writer
//! going straight to the store is only noticed once the TTL runs out.

use crate::error::Result;
use crate::metadata::ObjectInfo;
use crate::path::ObjectPath;
use diagnostics::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Object(String),
    Listing { dir: String, recursive: bool },
}

impl CacheKey {
    fn path(&self) -> &str {
        match self {
            CacheKey::Object(p) => p,
            CacheKey::Listing { dir, .. } => dir,
        }
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Object(ObjectInfo),
    Listing(Arc<Vec<ObjectInfo>>),
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < self.ttl
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    invalidations: AtomicU64,
}

pub struct MetadataCache {
    default_ttl: Duration,
    single_flight: bool,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// One cell per path currently being fetched
    in_flight: Mutex<HashMap<String, Arc<OnceCell<ObjectInfo>>>>,
    /// Bumped by every invalidation; fetches that started before a bump do
    /// not get to populate the cache.
    epoch: AtomicU64,
    counters: Counters,
}

impl MetadataCache {
    #[must_use]
    pub fn new(default_ttl: Duration, single_flight: bool) -> Self {
        Self {
            default_ttl,
            single_flight,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = Instant::now();
        let found = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(key).map(|e| (e.is_fresh(now), e.value.clone()))
        };
        match found {
            Some((true, value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("cache hit for {key}", key: key.path());
                Some(value)
            }
            Some((false, _)) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                if entries.get(key).is_some_and(|e| !e.is_fresh(now)) {
                    _ = entries.remove(key);
                }
                debug!("cache entry expired for {key}", key: key.path());
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("cache miss for {key}", key: key.path());
                None
            }
        }
    }

    fn insert(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        _ = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, path: &ObjectPath) -> Option<ObjectInfo> {
        match self.lookup(&CacheKey::Object(path.cache_key()))? {
            CachedValue::Object(info) => Some(info),
            CachedValue::Listing(_) => None,
        }
    }

    #[must_use]
    pub fn get_listing(&self, dir: &ObjectPath, recursive: bool) -> Option<Vec<ObjectInfo>> {
        let key = CacheKey::Listing {
            dir: dir.cache_key(),
            recursive,
        };
        match self.lookup(&key)? {
            CachedValue::Listing(entries) => Some(entries.as_ref().clone()),
            CachedValue::Object(_) => None,
        }
    }

    /// Cache `info` for `ttl` (the default when `None`; zero skips caching)
    pub fn put(&self, path: &ObjectPath, info: ObjectInfo, ttl: Option<Duration>) {
        self.insert(
            CacheKey::Object(path.cache_key()),
            CachedValue::Object(info),
            ttl,
        );
    }

    pub fn put_listing(
        &self,
        dir: &ObjectPath,
        recursive: bool,
        entries: Vec<ObjectInfo>,
        ttl: Option<Duration>,
    ) {
        let key = CacheKey::Listing {
            dir: dir.cache_key(),
            recursive,
        };
        self.insert(key, CachedValue::Listing(Arc::new(entries)), ttl);
    }

    /// Drop everything known about `path`, anything below it, and the
    /// listings (and synthesized entries) of every enclosing directory.
    pub fn invalidate(&self, path: &ObjectPath) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let own = path.cache_key();
        let below = format!("{}/", own.trim_end_matches('/'));
        let ancestors: Vec<String> = path.ancestors().map(|a| a.cache_key()).collect();

        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|key, _| {
                let p = key.path();
                let stale = p == own || p.starts_with(&below) || ancestors.iter().any(|a| a == p);
                !stale
            });
            before - entries.len()
        };

        _ = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&own);

        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("invalidated {count} cache entries for {path}", count: removed, path: own);
        }
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let n = entries.len();
            entries.clear();
            n
        };
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!("cache cleared ({count} entries)", count: removed);
    }

    /// Cache-first lookup, calling `fetch` on a miss.
    ///
    /// With single-flight enabled, concurrent misses for the same path share
    /// one fetch: at most one `fetch` runs at a time per path and its result
    /// is handed to every waiter. A failed fetch is not shared; the next
    /// waiter in line runs its own.
    pub async fn get_or_fetch<F, Fut>(&self, path: &ObjectPath, fetch: F) -> Result<ObjectInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ObjectInfo>>,
    {
        if let Some(info) = self.get(path) {
            return Ok(info);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);

        if !self.single_flight {
            let info = fetch().await?;
            self.put_if_current(path, &info, epoch);
            return Ok(info);
        }

        let key = path.cache_key();
        let cell = Arc::clone(
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default(),
        );

        let result = cell.get_or_try_init(fetch).await.cloned();

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                _ = in_flight.remove(&key);
            }
        }

        let info = result?;
        self.put_if_current(path, &info, epoch);
        Ok(info)
    }

    fn put_if_current(&self, path: &ObjectPath, info: &ObjectInfo, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.put(path, info.clone(), None);
        }
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("default_ttl", &self.default_ttl)
            .field("single_flight", &self.single_flight)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathResolver;
    use std::sync::atomic::AtomicUsize;

    fn path(p: &str) -> ObjectPath {
        PathResolver::default().resolve(p).unwrap()
    }

    fn file(p: &str, size: u64) -> ObjectInfo {
        ObjectInfo {
            path: path(p),
            size,
            etag: None,
            last_modified: None,
            is_directory: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_get_and_expiry() {
        let cache = MetadataCache::new(Duration::from_secs(10), false);
        let p = path("bucket/a/b");
        cache.put(&p, file("bucket/a/b", 3), None);

        assert_eq!(cache.get(&p).unwrap().size, 3);
        // directory intent does not change identity
        assert!(cache.get(&p.as_dir()).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&p).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.inserts, 1);
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = MetadataCache::new(Duration::from_secs(10), false);
        let p = path("bucket/x");
        cache.put(&p, file("bucket/x", 1), Some(Duration::ZERO));
        assert!(cache.get(&p).is_none());

        let cache = MetadataCache::new(Duration::ZERO, false);
        cache.put(&p, file("bucket/x", 1), None);
        assert!(cache.get(&p).is_none());
    }

    #[test]
    fn test_invalidate_drops_ancestor_listings() {
        let cache = MetadataCache::new(Duration::from_secs(60), false);
        let root = path("bucket");
        let a = path("bucket/a/");
        let c = path("bucket/a/c");
        let other = path("bucket/z/");

        cache.put_listing(&root, false, vec![ObjectInfo::directory(&a)], None);
        cache.put_listing(&root, true, vec![file("bucket/a/c", 1)], None);
        cache.put_listing(&a, false, vec![file("bucket/a/c", 1)], None);
        cache.put_listing(&other, false, vec![], None);
        cache.put(&c, file("bucket/a/c", 1), None);

        cache.invalidate(&c);

        assert!(cache.get(&c).is_none());
        assert!(cache.get_listing(&a, false).is_none());
        assert!(cache.get_listing(&root, false).is_none());
        assert!(cache.get_listing(&root, true).is_none());
        assert!(cache.get_listing(&other, false).is_some());
        assert_eq!(cache.stats().invalidations, 5 - 1);
    }

    #[test]
    fn test_invalidate_directory_drops_descendants() {
        let cache = MetadataCache::new(Duration::from_secs(60), false);
        cache.put(&path("bucket/a/b/c"), file("bucket/a/b/c", 1), None);
        cache.put(&path("bucket/ab"), file("bucket/ab", 1), None);

        cache.invalidate(&path("bucket/a/"));

        assert!(cache.get(&path("bucket/a/b/c")).is_none());
        assert!(cache.get(&path("bucket/ab")).is_some());

        cache.invalidate_all();
        assert!(cache.get(&path("bucket/ab")).is_none());
    }

    #[tokio::test]
    async fn test_get_or_fetch_caches_result() {
        let cache = MetadataCache::new(Duration::from_secs(60), true);
        let p = path("bucket/k");
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let info = cache
                .get_or_fetch(&p, || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(file("bucket/k", 9))
                })
                .await
                .unwrap();
            assert_eq!(info.size, 9);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        cache.invalidate(&p);
        cache
            .get_or_fetch(&p, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(file("bucket/k", 10))
            })
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = Arc::new(MetadataCache::new(Duration::ZERO, true));
        let fetches = Arc::new(AtomicUsize::new(0));
        let p = path("bucket/slow");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&p, || async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(file("bucket/slow", 5))
                    })
                    .await
            }));
        }
        // let every task reach the shared cell before the fetch finishes
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().size, 5);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = MetadataCache::new(Duration::from_secs(60), true);
        let p = path("bucket/missing");
        let err = cache
            .get_or_fetch(&p, || async {
                Err(crate::error::FsError::not_found("bucket/missing"))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let info = cache
            .get_or_fetch(&p, || async { Ok(file("bucket/missing", 1)) })
            .await
            .unwrap();
        assert_eq!(info.size, 1);
    }
}
