use catalogd::cache::CacheMode;
use catalogd::db::{DatabaseBackend, PostgresBackend, SqliteBackend};
use catalogd::server::{BackendType, Daemon, ServerConfig};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "catalogd", about = "Product catalog service with a query cache", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  /// sqlite or postgres
  #[arg(long, env = "CATALOGD_BACKEND")]
  backend: Option<String>,
  #[arg(long, env = "CATALOGD_SQLITE_PATH")]
  sqlite: Option<String>,
  #[arg(long, env = "CATALOGD_PG_URL")]
  pg_url: Option<String>,
  /// builtin or redis
  #[arg(long, env = "CATALOGD_CACHE_MODE")]
  cache_mode: Option<CacheMode>,
  #[arg(long, env = "CATALOGD_REDIS_HOST")]
  redis_host: Option<String>,
  #[arg(long, env = "CATALOGD_REDIS_PORT")]
  redis_port: Option<u16>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ServerConfig::from_file(path)?
  } else {
    ServerConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(backend) = args.backend {
    config.backend = match backend.to_lowercase().as_str() {
      "sqlite" => BackendType::Sqlite,
      "postgres" | "postgresql" => BackendType::Postgres,
      other => anyhow::bail!("Unknown backend: {}", other),
    };
  }
  if let Some(url) = args.pg_url {
    config.postgres.url = url;
    config.backend = BackendType::Postgres;
  }
  if let Some(path) = args.sqlite {
    config.sqlite.path = path;
    config.backend = BackendType::Sqlite;
  }
  if let Some(mode) = args.cache_mode {
    config.cache.mode = mode;
  }
  if let Some(host) = args.redis_host {
    config.cache.redis.host = host;
  }
  if let Some(port) = args.redis_port {
    config.cache.redis.port = port;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let backend: Arc<dyn DatabaseBackend> = match config.backend {
    BackendType::Postgres => Arc::new(PostgresBackend::new(
      &config.postgres.url,
      config.postgres.max_connections,
    )?),
    BackendType::Sqlite => Arc::new(SqliteBackend::new(&config.sqlite.path).await?),
  };

  let daemon = Arc::new(Daemon::new(config, backend).await?);
  let daemon_clone = daemon.clone();

  // Handle shutdown signals (SIGINT, SIGTERM)
  tokio::spawn(async move {
    shutdown_signal().await;
    daemon_clone.shutdown();
  });

  daemon.run().await?;
  tracing::info!("Shutdown complete");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
