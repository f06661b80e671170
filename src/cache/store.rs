//! Cache store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::entry::CacheEntry;

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub memory_used: usize,
  pub hits: u64,
  pub misses: u64,
  /// Keys removed by prefix eviction
  pub evictions: u64,
  pub expired: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// Store operation error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheStoreError {
  #[error("cache backend unavailable: {0}")]
  Unavailable(String),
  #[error("cache operation timed out after {0:?}")]
  Timeout(Duration),
  #[error("cache value could not be encoded: {0}")]
  Serialization(String),
}

/// Key-value backend behind the query cache.
///
/// Implementations must make `set`/`get` atomic per key and must remove every
/// matching key in `delete_prefix`.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError>;
  async fn set(
    &self,
    key: &str,
    value: String,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError>;
  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;
  /// Remove every key starting with `prefix`, returning how many were removed.
  async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError>;
  /// Remaining time to live; `None` when the key is missing or never expires.
  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError>;
  async fn info(&self) -> CacheStats;
}

/// In-memory cache store implementation
pub struct InMemoryCacheStore {
  data: RwLock<HashMap<String, CacheEntry>>,
  memory_used: AtomicUsize,
  default_ttl: Option<Duration>,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
}

impl Default for InMemoryCacheStore {
  fn default() -> Self {
    Self::new(None)
  }
}

impl InMemoryCacheStore {
  pub fn new(default_ttl: Option<Duration>) -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      memory_used: AtomicUsize::new(0),
      default_ttl,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  /// Check and evict expired entries
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let expired_keys: Vec<String> = data
      .iter()
      .filter(|(_, entry)| entry.is_expired())
      .map(|(k, _)| k.clone())
      .collect();

    let count = expired_keys.len();
    for key in expired_keys {
      if let Some(entry) = data.remove(&key) {
        self.memory_used.fetch_sub(entry.size(), Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
    }
    count
  }

  /// Drop `key` if it is still expired. Readers only hold the read lock, so the
  /// removal is deferred to this write-locked recheck.
  fn remove_if_expired(&self, key: &str) {
    let mut data = self.data.write();
    let still_expired = data.get(key).map(|e| e.is_expired()).unwrap_or(false);
    if still_expired {
      if let Some(entry) = data.remove(key) {
        self.memory_used.fetch_sub(entry.size(), Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
    }
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
    let found = {
      let data = self.data.read();
      data.get(key).map(|entry| {
        if entry.is_expired() {
          None
        } else {
          Some(entry.clone())
        }
      })
    };

    match found {
      Some(Some(entry)) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
      }
      Some(None) => {
        self.remove_if_expired(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
      }
    }
  }

  async fn set(
    &self,
    key: &str,
    value: String,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let effective_ttl = ttl.or(self.default_ttl);
    let entry = CacheEntry::new(key.to_string(), value, effective_ttl);
    let new_size = entry.size();

    let mut data = self.data.write();
    if let Some(old) = data.insert(key.to_string(), entry) {
      self.memory_used.fetch_sub(old.size(), Ordering::Relaxed);
    }
    self.memory_used.fetch_add(new_size, Ordering::Relaxed);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    match data.remove(key) {
      Some(entry) => {
        self.memory_used.fetch_sub(entry.size(), Ordering::Relaxed);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
    // One write lock for the whole sweep: a concurrent get sees either the
    // pre-eviction map or the post-eviction map.
    let mut data = self.data.write();
    let mut removed = 0usize;
    let mut freed = 0usize;
    data.retain(|key, entry| {
      if key.starts_with(prefix) {
        removed += 1;
        freed += entry.size();
        false
      } else {
        true
      }
    });
    self.memory_used.fetch_sub(freed, Ordering::Relaxed);
    self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    Ok(removed)
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
    let data = self.data.read();
    Ok(data.get(key).and_then(|entry| entry.ttl_remaining()))
  }

  async fn info(&self) -> CacheStats {
    let data = self.data.read();
    CacheStats {
      keys: data.iter().filter(|(_, e)| !e.is_expired()).count(),
      memory_used: self.memory_used.load(Ordering::Relaxed),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    }
  }
}
