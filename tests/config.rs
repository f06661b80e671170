use catalogd::cache::CacheMode;
use catalogd::query::InvalidationOrder;
use catalogd::server::{BackendType, ServerConfig};
use std::io::Write;

#[test]
fn test_default_config() {
  let config = ServerConfig::default();
  assert_eq!(config.backend, BackendType::Sqlite);
  assert_eq!(config.sqlite.path, "catalog.db");
  assert_eq!(config.postgres.max_connections, 20);
  assert_eq!(config.logging.level, "info");
  assert_eq!(config.cache.mode, CacheMode::Builtin);
  assert_eq!(config.cache.invalidation, InvalidationOrder::AfterCommit);
  assert_eq!(config.auth.remember_me.validity_secs, 86400);
  assert_eq!(config.auth.token_store_timeout_ms, 2000);
}

#[test]
fn test_load_from_file_with_env() {
  std::env::set_var("CATALOGD_IT_REDIS_PASSWORD", "hunter2");
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(
    file,
    r#"
backend: sqlite
sqlite:
  path: /var/lib/catalogd/catalog.db
cache:
  mode: redis
  default_ttl_secs: 60
  redis:
    password: ${{CATALOGD_IT_REDIS_PASSWORD}}
auth:
  token_store_timeout_ms: 500
"#
  )
  .unwrap();

  let config = ServerConfig::from_file(file.path()).unwrap();
  assert_eq!(config.sqlite.path, "/var/lib/catalogd/catalog.db");
  assert_eq!(config.cache.mode, CacheMode::Redis);
  assert_eq!(config.cache.default_ttl_secs, 60);
  assert_eq!(config.cache.redis.password.as_deref(), Some("hunter2"));
  assert_eq!(config.cache.redis.host, "localhost");
  assert_eq!(config.auth.token_store_timeout_ms, 500);
}

#[test]
fn test_invalid_yaml_is_an_error() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "backend: oracle").unwrap();
  assert!(ServerConfig::from_file(file.path()).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
  assert!(ServerConfig::from_file("/nonexistent/catalogd.yaml").is_err());
}

#[test]
fn test_invalidation_order_parse() {
  assert_eq!(
    "before-and-after".parse::<InvalidationOrder>().unwrap(),
    InvalidationOrder::BeforeAndAfter
  );
  assert_eq!(
    "after".parse::<InvalidationOrder>().unwrap(),
    InvalidationOrder::AfterCommit
  );
  assert!("never".parse::<InvalidationOrder>().is_err());
}
