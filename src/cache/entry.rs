//! Cache entry types

use std::time::Duration;
use tokio::time::Instant;

/// A cached value with its expiry metadata. Entries are replaced whole by
/// `set`; nothing updates one in place.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  /// Serialized payload (JSON text for query pages)
  pub value: String,
  pub ttl: Option<Duration>,
  pub created_at: Instant,
  pub expires_at: Option<Instant>,
}

impl CacheEntry {
  pub fn new(key: String, value: String, ttl: Option<Duration>) -> Self {
    let now = Instant::now();
    Self {
      key,
      value,
      ttl,
      created_at: now,
      expires_at: ttl.map(|d| now + d),
    }
  }

  /// Expired once the expiry instant is reached, so a zero TTL is never readable.
  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.expires_at.and_then(|exp| {
      let now = Instant::now();
      if now >= exp {
        None
      } else {
        Some(exp - now)
      }
    })
  }

  /// Size in bytes (approximate)
  pub fn size(&self) -> usize {
    self.key.len() + self.value.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_entry_expiry() {
    let entry = CacheEntry::new("k".into(), "v".into(), Some(Duration::from_secs(10)));
    assert!(!entry.is_expired());
    assert_eq!(entry.ttl_remaining(), Some(Duration::from_secs(10)));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(entry.is_expired());
    assert_eq!(entry.ttl_remaining(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_without_ttl_never_expires() {
    let entry = CacheEntry::new("k".into(), "v".into(), None);
    tokio::time::advance(Duration::from_secs(86_400)).await;
    assert!(!entry.is_expired());
    assert_eq!(entry.size(), 2);
  }
}
