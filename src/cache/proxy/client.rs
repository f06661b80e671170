//! Redis-backed cache store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::config::RedisConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::store::{CacheStats, CacheStore, CacheStoreError};

/// Keys requested per SCAN round trip and deleted per DEL.
const SCAN_BATCH: usize = 500;

/// Cache store on an external Redis server
pub struct RedisCacheStore {
  connection: ConnectionManager,
  config: RedisConfig,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
}

impl RedisCacheStore {
  /// Connect to the server described by `config`
  pub async fn new(config: RedisConfig) -> Result<Self, RedisError> {
    let client = Client::open(config.connection_url())?;
    let connection = ConnectionManager::new(client).await?;

    Ok(Self {
      connection,
      config,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
    })
  }

  pub fn config(&self) -> &RedisConfig {
    &self.config
  }

  /// Test the connection to Redis
  pub async fn test_connection(&self) -> Result<(), RedisError> {
    let mut conn = self.connection.clone();
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

fn unavailable(e: RedisError) -> CacheStoreError {
  CacheStoreError::Unavailable(e.to_string())
}

/// Escape glob metacharacters so `prefix` matches literally in SCAN MATCH.
pub(crate) fn escape_glob(prefix: &str) -> String {
  let mut out = String::with_capacity(prefix.len() + 4);
  for c in prefix.chars() {
    if matches!(c, '*' | '?' | '[' | ']' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

#[async_trait]
impl CacheStore for RedisCacheStore {
  async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let value: Option<String> = conn.get(key).await.map_err(unavailable)?;

    match value {
      Some(value) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        // Remaining TTL is only needed by callers that ask for it via `ttl`.
        Ok(Some(CacheEntry::new(key.to_string(), value, None)))
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
    let mut conn = self.connection.clone();

    let result: Result<(), RedisError> = match ttl {
      Some(duration) => {
        let millis = (duration.as_millis() as u64).max(1);
        conn.pset_ex(key, value, millis).await
      }
      None => conn.set(key, value).await,
    };

    result.map_err(unavailable)
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let removed: i64 = conn.del(key).await.map_err(unavailable)?;
    Ok(removed > 0)
  }

  async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
    let mut conn = self.connection.clone();
    let pattern = format!("{}*", escape_glob(prefix));
    let mut cursor: u64 = 0;
    let mut removed = 0usize;

    loop {
      let (next, keys) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(&pattern)
        .arg("COUNT")
        .arg(SCAN_BATCH)
        .query_async::<(u64, Vec<String>)>(&mut conn)
        .await
        .map_err(unavailable)?;

      for chunk in keys.chunks(SCAN_BATCH) {
        let n: usize = conn.del(chunk).await.map_err(unavailable)?;
        removed += n;
      }

      if next == 0 {
        break;
      }
      cursor = next;
    }

    self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    Ok(removed)
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let millis: i64 = conn.pttl(key).await.map_err(unavailable)?;
    // -2: missing key, -1: no expiry
    if millis < 0 {
      Ok(None)
    } else {
      Ok(Some(Duration::from_millis(millis as u64)))
    }
  }

  async fn info(&self) -> CacheStats {
    let mut conn = self.connection.clone();

    let info: Result<String, _> = redis::cmd("INFO")
      .arg("memory")
      .query_async(&mut conn)
      .await;
    let dbsize: Result<usize, _> = redis::cmd("DBSIZE").query_async(&mut conn).await;

    let mut memory_used = 0usize;
    if let Ok(info_str) = info {
      for line in info_str.lines() {
        if let Some(val) = line.strip_prefix("used_memory:") {
          memory_used = val.trim().parse().unwrap_or(0);
        }
      }
    }

    CacheStats {
      keys: dbsize.unwrap_or(0),
      memory_used,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expired: 0, // Redis expires keys on its own
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_escape_glob() {
    assert_eq!(escape_glob("products:"), "products:");
    assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
  }
}
