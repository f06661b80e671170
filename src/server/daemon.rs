use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::ServerConfig;
use crate::auth::{DbCredentialVerifier, PersistentTokenStore, SessionAuthority};
use crate::cache::{run_expiration_task, CacheMode, CacheStore, InMemoryCacheStore, ResultCache};
use crate::db::DatabaseBackend;
use crate::query::Catalog;

/// Owns the catalog, the query cache and the session authority for the
/// lifetime of the process.
pub struct Daemon {
  config: ServerConfig,
  backend: Arc<dyn DatabaseBackend>,
  cache: Arc<ResultCache>,
  // Present only in builtin mode; swept by a background task.
  memory_store: Option<Arc<InMemoryCacheStore>>,
  catalog: Arc<Catalog>,
  sessions: Arc<SessionAuthority>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  /// Initialize the schema, connect the cache store and wire the services.
  pub async fn new(
    config: ServerConfig,
    backend: Arc<dyn DatabaseBackend>,
  ) -> Result<Self, anyhow::Error> {
    tracing::info!("Initializing database schema...");
    backend.init_schema().await?;
    tracing::info!("Database schema initialized");

    let (store, memory_store) = build_cache_store(&config).await?;
    let cache = Arc::new(ResultCache::new(store, &config.cache));
    let mode = if memory_store.is_some() {
      CacheMode::Builtin
    } else {
      config.cache.mode
    };
    tracing::info!(
      "Query cache ready: mode={}, ttl={}s, invalidation={}",
      mode,
      config.cache.default_ttl_secs,
      config.cache.invalidation
    );

    let tokens = Arc::new(PersistentTokenStore::new(
      backend.clone(),
      config.auth.token_store_timeout(),
    ));
    let verifier = Arc::new(DbCredentialVerifier::new(backend.clone()));
    let sessions = Arc::new(SessionAuthority::new(
      tokens,
      verifier.clone(),
      verifier,
      config.auth.remember_me.validity(),
    ));
    let catalog = Arc::new(Catalog::new(
      backend.clone(),
      cache.clone(),
      sessions.clone(),
      config.cache.invalidation,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(Self {
      config,
      backend,
      cache,
      memory_store,
      catalog,
      sessions,
      shutdown_tx,
    })
  }

  pub fn config(&self) -> &ServerConfig {
    &self.config
  }

  pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
    &self.backend
  }

  pub fn cache(&self) -> &Arc<ResultCache> {
    &self.cache
  }

  pub fn catalog(&self) -> &Arc<Catalog> {
    &self.catalog
  }

  pub fn sessions(&self) -> &Arc<SessionAuthority> {
    &self.sessions
  }

  /// Trigger graceful shutdown of the background tasks
  pub fn shutdown(&self) {
    tracing::info!("Initiating graceful shutdown...");
    let _ = self.shutdown_tx.send(());
  }

  /// Run the maintenance tasks until [`Daemon::shutdown`] is called.
  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let mut shutdown_rx = self.shutdown_tx.subscribe();
    let mut tasks = Vec::new();

    if let Some(store) = &self.memory_store {
      let interval = self.config.cache.sweep_interval();
      tracing::info!("Starting cache expiry sweeper every {:?}", interval);
      tasks.push(tokio::spawn(run_expiration_task(store.clone(), interval)));
    }

    let purge_secs = self.config.auth.remember_me.purge_interval_secs;
    if purge_secs > 0 {
      let sessions = self.sessions.clone();
      tasks.push(tokio::spawn(async move {
        loop {
          tokio::time::sleep(Duration::from_secs(purge_secs)).await;
          match sessions.purge_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Purged {} expired remember-me grants", n),
            Err(e) => tracing::warn!("Remember-me purge failed: {}", e),
          }
        }
      }));
    } else {
      tracing::info!("Remember-me purge disabled");
    }

    tracing::info!("catalogd running");
    let _ = shutdown_rx.recv().await;

    for task in tasks {
      task.abort();
    }
    tracing::info!(
      "Stopped with {} active sessions, cache stats {:?}",
      self.sessions.active_sessions(),
      self.cache.stats().await
    );
    Ok(())
  }
}

/// Upper bound on connecting to and pinging Redis at startup.
#[cfg(feature = "redis")]
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

type StoreChoice = (Arc<dyn CacheStore>, Option<Arc<InMemoryCacheStore>>);

fn builtin_store(config: &ServerConfig) -> StoreChoice {
  let store = Arc::new(InMemoryCacheStore::new(Some(config.cache.default_ttl())));
  (store.clone(), Some(store))
}

/// Select the cache store. An unreachable Redis degrades to the builtin
/// store, since the cache is optional for correctness.
async fn build_cache_store(config: &ServerConfig) -> Result<StoreChoice, anyhow::Error> {
  match config.cache.mode {
    CacheMode::Builtin => Ok(builtin_store(config)),
    #[cfg(feature = "redis")]
    CacheMode::Redis => {
      let redis = &config.cache.redis;
      tracing::info!("Connecting to Redis at {}:{}", redis.host, redis.port);
      match connect_redis(redis).await {
        Ok(store) => Ok((Arc::new(store), None)),
        Err(e) => {
          tracing::warn!(
            "Redis at {}:{} unavailable ({}), using the builtin cache",
            redis.host,
            redis.port,
            e
          );
          Ok(builtin_store(config))
        }
      }
    }
    #[cfg(not(feature = "redis"))]
    CacheMode::Redis => anyhow::bail!("cache mode redis requires the `redis` feature"),
  }
}

#[cfg(feature = "redis")]
async fn connect_redis(
  config: &crate::cache::RedisConfig,
) -> Result<crate::cache::RedisCacheStore, anyhow::Error> {
  let connect = async {
    let store = crate::cache::RedisCacheStore::new(config.clone()).await?;
    store.test_connection().await?;
    Ok::<_, redis::RedisError>(store)
  };
  Ok(tokio::time::timeout(REDIS_CONNECT_TIMEOUT, connect).await??)
}
