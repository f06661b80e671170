//! Periodic expiry sweep for the builtin store

use std::sync::Arc;
use std::time::Duration;

use super::store::InMemoryCacheStore;

/// Remove expired entries every `interval`. Runs until the task is dropped.
pub async fn run_expiration_task(store: Arc<InMemoryCacheStore>, interval: Duration) {
  loop {
    tokio::time::sleep(interval).await;
    let expired = store.evict_expired();
    if expired > 0 {
      tracing::debug!("Evicted {} expired keys", expired);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_removes_expired_entries() {
    let store = Arc::new(InMemoryCacheStore::default());
    store
      .set("k", "v".into(), Some(Duration::from_secs(5)))
      .await
      .unwrap();

    let task = tokio::spawn(run_expiration_task(store.clone(), Duration::from_secs(10)));
    tokio::time::sleep(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;

    assert_eq!(store.info().await.expired, 1);
    task.abort();
  }
}
