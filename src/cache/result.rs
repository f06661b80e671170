//! Typed page cache over a [`CacheStore`].
//!
//! The cache is strictly best effort: a backend error or a call slower than
//! the configured timeout is logged and reported to the caller as a miss (for
//! reads) or a no-op (for writes). Callers never see a cache failure.
//!
//! An eviction that does not finish leaves its namespace dirty. Reads of a
//! dirty namespace retry the eviction and miss until one succeeds, and writes
//! to it are skipped, so a failed eviction never serves stale pages.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use types::PageResult;

use super::config::CacheConfig;
use super::key::namespace_prefix;
use super::store::{CacheStats, CacheStore, CacheStoreError};

pub struct ResultCache {
  store: Arc<dyn CacheStore>,
  default_ttl: Duration,
  op_timeout: Duration,
  eviction_timeout: Duration,
  key_prefix: String,
  /// One async lock per namespace so sweeps of the same namespace never overlap.
  eviction_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  /// Namespaces whose last eviction did not complete.
  dirty: Mutex<HashSet<String>>,
}

impl ResultCache {
  pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
    Self {
      store,
      default_ttl: config.default_ttl(),
      op_timeout: config.op_timeout(),
      eviction_timeout: config.eviction_timeout(),
      key_prefix: config.key_prefix.trim_end_matches(':').to_string(),
      eviction_locks: Mutex::new(HashMap::new()),
      dirty: Mutex::new(HashSet::new()),
    }
  }

  pub fn with_defaults(store: Arc<dyn CacheStore>) -> Self {
    Self::new(store, &CacheConfig::default())
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Namespace as it appears in the store, with the application prefix.
  pub fn qualify(&self, namespace: &str) -> String {
    if self.key_prefix.is_empty() {
      namespace.to_string()
    } else {
      format!("{}:{}", self.key_prefix, namespace)
    }
  }

  /// Whether the last eviction of `namespace` failed and has not been
  /// retried successfully yet.
  pub fn is_dirty(&self, namespace: &str) -> bool {
    self.dirty.lock().contains(namespace)
  }

  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<PageResult<T>> {
    if let Some(namespace) = self.dirty_namespace_of(key) {
      if !self.retry_eviction(&namespace).await {
        tracing::debug!(key = %key, namespace = %namespace, "Bypassing dirty cache namespace");
        return None;
      }
    }

    let entry = match self
      .bounded("get", key, self.op_timeout, self.store.get(key))
      .await
    {
      Some(Some(entry)) => entry,
      _ => return None,
    };

    match serde_json::from_str::<PageResult<T>>(&entry.value) {
      Ok(page) => Some(page),
      Err(e) => {
        tracing::warn!(key = %key, error = %e, "Dropping undecodable cache entry");
        self
          .bounded("delete", key, self.op_timeout, self.store.delete(key))
          .await;
        None
      }
    }
  }

  /// Store a page under `key`. Empty pages and pages of a dirty namespace are
  /// skipped. Returns whether the page was written.
  pub async fn put<T: Serialize>(
    &self,
    key: &str,
    page: &PageResult<T>,
    ttl: Option<Duration>,
  ) -> bool {
    if page.is_empty() {
      tracing::trace!(key = %key, "Not caching empty page");
      return false;
    }
    if self.dirty_namespace_of(key).is_some() {
      tracing::debug!(key = %key, "Not caching into dirty namespace");
      return false;
    }

    let value = match serde_json::to_string(page) {
      Ok(v) => v,
      Err(e) => {
        let err = CacheStoreError::Serialization(e.to_string());
        tracing::warn!(key = %key, error = %err, "Cache put skipped");
        return false;
      }
    };

    let ttl = ttl.unwrap_or(self.default_ttl);
    self
      .bounded("set", key, self.op_timeout, self.store.set(key, value, Some(ttl)))
      .await
      .is_some()
  }

  /// Remove every entry of `namespace`. Returns the number of removed keys.
  /// When the sweep fails or outlasts the eviction timeout it returns 0 and
  /// the namespace stays dirty until a later eviction succeeds.
  pub async fn evict_namespace(&self, namespace: &str) -> usize {
    let lock = self.eviction_lock(namespace);
    let _guard = lock.lock().await;
    self.sweep(namespace).await.unwrap_or(0)
  }

  pub async fn stats(&self) -> CacheStats {
    self.store.info().await
  }

  fn eviction_lock(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.eviction_locks.lock();
    locks
      .entry(namespace.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  fn dirty_namespace_of(&self, key: &str) -> Option<String> {
    let dirty = self.dirty.lock();
    if dirty.is_empty() {
      return None;
    }
    dirty
      .iter()
      .find(|ns| key.starts_with(&namespace_prefix(ns)))
      .cloned()
  }

  /// Retry the eviction of a dirty namespace from the read path. Returns true
  /// once the namespace is clean. A sweep already in flight counts as not
  /// clean yet.
  async fn retry_eviction(&self, namespace: &str) -> bool {
    let lock = self.eviction_lock(namespace);
    let Ok(_guard) = lock.try_lock() else {
      return false;
    };
    if !self.is_dirty(namespace) {
      return true;
    }
    self.sweep(namespace).await.is_some()
  }

  /// Caller holds the namespace's eviction lock.
  async fn sweep(&self, namespace: &str) -> Option<usize> {
    let prefix = namespace_prefix(namespace);
    let removed = self
      .bounded(
        "delete_prefix",
        &prefix,
        self.eviction_timeout,
        self.store.delete_prefix(&prefix),
      )
      .await;

    match removed {
      Some(removed) => {
        self.dirty.lock().remove(namespace);
        tracing::info!(namespace = %namespace, removed, "Evicted cache namespace");
        Some(removed)
      }
      None => {
        self.dirty.lock().insert(namespace.to_string());
        tracing::warn!(namespace = %namespace, "Eviction incomplete, namespace marked dirty");
        None
      }
    }
  }

  /// Run a store call under `limit`, logging and discarding any failure.
  async fn bounded<T, F>(&self, op: &str, key: &str, limit: Duration, fut: F) -> Option<T>
  where
    F: Future<Output = Result<T, CacheStoreError>>,
  {
    match tokio::time::timeout(limit, fut).await {
      Ok(Ok(value)) => Some(value),
      Ok(Err(e)) => {
        tracing::warn!(op, key = %key, error = %e, "Cache call failed, continuing without cache");
        None
      }
      Err(_) => {
        let err = CacheStoreError::Timeout(limit);
        tracing::warn!(op, key = %key, error = %err, "Cache call failed, continuing without cache");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, InMemoryCacheStore};
  use async_trait::async_trait;
  use std::collections::BTreeSet;
  use std::sync::atomic::{AtomicBool, Ordering};

  fn page(records: Vec<i32>) -> PageResult<i32> {
    let total = records.len() as u64;
    PageResult::new(records, total, 1, 10)
  }

  /// Store whose calls never complete within any sensible timeout.
  struct StalledStore;

  #[async_trait]
  impl CacheStore for StalledStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
      tokio::time::sleep(Duration::from_secs(3600)).await;
      Ok(None)
    }
    async fn set(
      &self,
      _key: &str,
      _value: String,
      _ttl: Option<Duration>,
    ) -> Result<(), CacheStoreError> {
      tokio::time::sleep(Duration::from_secs(3600)).await;
      Ok(())
    }
    async fn delete(&self, _key: &str) -> Result<bool, CacheStoreError> {
      Err(CacheStoreError::Unavailable("down".into()))
    }
    async fn delete_prefix(&self, _prefix: &str) -> Result<usize, CacheStoreError> {
      Err(CacheStoreError::Unavailable("down".into()))
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CacheStoreError> {
      Ok(None)
    }
    async fn info(&self) -> CacheStats {
      CacheStats::default()
    }
  }

  /// Store whose prefix sweep deletes ten keys per 50ms round trip while
  /// `slow` is set, like a SCAN/DEL loop against a remote server.
  struct SlowSweepStore {
    inner: InMemoryCacheStore,
    written: parking_lot::Mutex<BTreeSet<String>>,
    slow: AtomicBool,
  }

  impl SlowSweepStore {
    fn new() -> Self {
      Self {
        inner: InMemoryCacheStore::default(),
        written: parking_lot::Mutex::new(BTreeSet::new()),
        slow: AtomicBool::new(true),
      }
    }
  }

  #[async_trait]
  impl CacheStore for SlowSweepStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
      self.inner.get(key).await
    }
    async fn set(
      &self,
      key: &str,
      value: String,
      ttl: Option<Duration>,
    ) -> Result<(), CacheStoreError> {
      self.written.lock().insert(key.to_string());
      self.inner.set(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
      self.written.lock().remove(key);
      self.inner.delete(key).await
    }
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
      if !self.slow.load(Ordering::SeqCst) {
        self.written.lock().retain(|k| !k.starts_with(prefix));
        return self.inner.delete_prefix(prefix).await;
      }
      let matching: Vec<String> = self
        .written
        .lock()
        .iter()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      let mut removed = 0;
      for batch in matching.chunks(10) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for key in batch {
          if self.delete(key).await? {
            removed += 1;
          }
        }
      }
      Ok(removed)
    }
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
      self.inner.ttl(key).await
    }
    async fn info(&self) -> CacheStats {
      self.inner.info().await
    }
  }

  async fn fill(cache: &ResultCache, pages: usize) {
    for i in 0..pages {
      assert!(cache.put(&format!("products:page={}", i), &page(vec![1]), None).await);
    }
  }

  #[tokio::test]
  async fn test_put_then_get() {
    let cache = ResultCache::with_defaults(Arc::new(InMemoryCacheStore::default()));
    assert!(cache.put("products:page=1", &page(vec![1, 2]), None).await);
    let hit: PageResult<i32> = cache.get("products:page=1").await.unwrap();
    assert_eq!(hit, page(vec![1, 2]));
  }

  #[tokio::test]
  async fn test_put_applies_default_ttl() {
    let store = Arc::new(InMemoryCacheStore::default());
    let cache = ResultCache::with_defaults(store.clone());
    cache.put("k", &page(vec![1]), None).await;
    let ttl = store.ttl("k").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(1800));
    assert!(ttl > Duration::from_secs(1790));
  }

  #[tokio::test]
  async fn test_empty_page_is_not_cached() {
    let store = Arc::new(InMemoryCacheStore::default());
    let cache = ResultCache::with_defaults(store.clone());
    assert!(!cache.put("k", &page(vec![]), None).await);
    assert_eq!(store.info().await.keys, 0);
  }

  #[tokio::test]
  async fn test_undecodable_entry_is_dropped() {
    let store = Arc::new(InMemoryCacheStore::default());
    store.set("k", "not json".into(), None).await.unwrap();
    let cache = ResultCache::with_defaults(store.clone());
    assert!(cache.get::<i32>("k").await.is_none());
    assert!(store.get("k").await.unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stalled_backend_degrades_to_miss() {
    let cache = ResultCache::with_defaults(Arc::new(StalledStore));
    assert!(cache.get::<i32>("k").await.is_none());
    assert!(!cache.put("k", &page(vec![1]), None).await);
    assert_eq!(cache.evict_namespace("products").await, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_multi_round_trip_sweep_outlives_op_timeout() {
    let store = Arc::new(SlowSweepStore::new());
    let cache = ResultCache::with_defaults(store.clone());
    fill(&cache, 100).await;

    // Ten 50ms round trips, well past the 200ms per-call bound.
    assert_eq!(cache.evict_namespace("products").await, 100);
    assert!(!cache.is_dirty("products"));
    assert_eq!(store.info().await.keys, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unfinished_eviction_bypasses_stale_pages() {
    let store = Arc::new(SlowSweepStore::new());
    let config = CacheConfig {
      eviction_timeout_ms: 120,
      ..Default::default()
    };
    let cache = ResultCache::new(store.clone(), &config);
    fill(&cache, 100).await;
    assert!(cache.put("users:page=1", &page(vec![7]), None).await);

    assert_eq!(cache.evict_namespace("products").await, 0);
    assert!(cache.is_dirty("products"));
    assert!(store.info().await.keys > 1);

    // Stale pages are still stored but never served, and no new page lands.
    let stale: Vec<String> = store
      .written
      .lock()
      .iter()
      .filter(|k| k.starts_with("products:"))
      .cloned()
      .collect();
    assert!(!stale.is_empty());
    assert!(!cache.put("products:page=0", &page(vec![2]), None).await);
    assert!(cache.get::<i32>(&stale[stale.len() - 1]).await.is_none());
    assert!(cache.is_dirty("products"));
    assert!(cache.get::<i32>("users:page=1").await.is_some());

    // The next read retries the sweep and clears the namespace once it fits.
    store.slow.store(false, Ordering::SeqCst);
    assert!(cache.get::<i32>("products:page=99").await.is_none());
    assert!(!cache.is_dirty("products"));
    assert_eq!(store.info().await.keys, 1);
    assert!(cache.put("products:page=0", &page(vec![2]), None).await);
    assert_eq!(cache.get::<i32>("products:page=0").await, Some(page(vec![2])));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_eviction_is_retried_by_the_next_one() {
    let store = Arc::new(SlowSweepStore::new());
    let config = CacheConfig {
      eviction_timeout_ms: 120,
      ..Default::default()
    };
    let cache = ResultCache::new(store.clone(), &config);
    fill(&cache, 40).await;

    assert_eq!(cache.evict_namespace("products").await, 0);
    assert!(cache.is_dirty("products"));

    store.slow.store(false, Ordering::SeqCst);
    assert!(cache.evict_namespace("products").await > 0);
    assert!(!cache.is_dirty("products"));
    assert_eq!(store.info().await.keys, 0);
  }

  #[tokio::test]
  async fn test_evict_namespace_is_isolated() {
    let cache = ResultCache::with_defaults(Arc::new(InMemoryCacheStore::default()));
    cache.put("products:page=1", &page(vec![1]), None).await;
    cache.put("products:page=2", &page(vec![2]), None).await;
    cache.put("productsx:page=1", &page(vec![3]), None).await;
    cache.put("users:page=1", &page(vec![4]), None).await;

    assert_eq!(cache.evict_namespace("products").await, 2);
    assert!(cache.get::<i32>("products:page=1").await.is_none());
    assert!(cache.get::<i32>("productsx:page=1").await.is_some());
    assert!(cache.get::<i32>("users:page=1").await.is_some());
    assert_eq!(cache.evict_namespace("products").await, 0);
  }

  #[test]
  fn test_qualify() {
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::default());
    let plain = ResultCache::with_defaults(store.clone());
    assert_eq!(plain.qualify("products"), "products");

    let config = CacheConfig {
      key_prefix: "product-system:".into(),
      ..Default::default()
    };
    let prefixed = ResultCache::new(store, &config);
    assert_eq!(prefixed.qualify("products"), "product-system:products");
  }
}
