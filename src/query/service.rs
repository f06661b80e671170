use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use types::{PageRequest, PageResult};

use super::InvalidationOrder;
use crate::cache::{QueryKeyCodec, ResultCache};

/// Read-through cache for one query family.
///
/// Reads check the cache first and fall back to the storage query on a miss.
/// Writes go through [`mutate`](Self::mutate), which evicts the whole
/// namespace once the write has committed.
pub struct CachedQueryService<T> {
  cache: Arc<ResultCache>,
  codec: QueryKeyCodec,
  ttl: Option<Duration>,
  order: InvalidationOrder,
  _records: PhantomData<fn() -> T>,
}

impl<T> CachedQueryService<T>
where
  T: Serialize + DeserializeOwned,
{
  /// The codec's namespace is qualified with the cache's application prefix.
  pub fn new(cache: Arc<ResultCache>, codec: QueryKeyCodec) -> Self {
    let codec = codec.renamed(cache.qualify(codec.namespace()));
    Self {
      cache,
      codec,
      ttl: None,
      order: InvalidationOrder::default(),
      _records: PhantomData,
    }
  }

  /// Override the cache's default TTL for this family.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_invalidation_order(mut self, order: InvalidationOrder) -> Self {
    self.order = order;
    self
  }

  /// Fully qualified namespace, as stored.
  pub fn namespace(&self) -> &str {
    self.codec.namespace()
  }

  pub fn key_for(&self, request: &PageRequest) -> String {
    self.codec.encode(request)
  }

  /// Serve `request` from the cache, or run `storage` and cache its result.
  ///
  /// A storage error is returned unchanged and nothing is cached. Concurrent
  /// misses on one key may each run the storage query.
  pub async fn query<F, Fut, E>(
    &self,
    request: &PageRequest,
    storage: F,
  ) -> Result<PageResult<T>, E>
  where
    F: FnOnce(PageRequest) -> Fut,
    Fut: Future<Output = Result<PageResult<T>, E>>,
  {
    let key = self.key_for(request);

    if let Some(page) = self.cache.get::<T>(&key).await {
      tracing::debug!(key = %key, "Query cache hit");
      return Ok(page);
    }
    tracing::debug!(key = %key, "Query cache miss");

    let page = storage(request.clone()).await?;
    self.cache.put(&key, &page, self.ttl).await;
    Ok(page)
  }

  /// Evict every cached page of this family. Idempotent.
  pub async fn invalidate_on_mutation(&self) -> usize {
    self.cache.evict_namespace(self.codec.namespace()).await
  }

  /// Run a write and invalidate the namespace around it according to the
  /// configured [`InvalidationOrder`].
  pub async fn mutate<Fut, R, E>(&self, write: Fut) -> Result<R, E>
  where
    Fut: Future<Output = Result<R, E>>,
  {
    let conservative = self.order == InvalidationOrder::BeforeAndAfter;
    if conservative {
      self.invalidate_on_mutation().await;
    }

    let result = write.await;
    // A failed write may still have partially committed.
    if result.is_ok() || conservative {
      self.invalidate_on_mutation().await;
    }
    result
  }
}
