//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::query::InvalidationOrder;

/// Cache mode: builtin in-memory or an external Redis server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// In-memory cache (default)
  #[default]
  Builtin,
  /// External Redis server
  Redis,
}

impl std::fmt::Display for CacheMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheMode::Builtin => write!(f, "builtin"),
      CacheMode::Redis => write!(f, "redis"),
    }
  }
}

impl std::str::FromStr for CacheMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "builtin" | "memory" | "inmemory" => Ok(CacheMode::Builtin),
      "redis" | "external" | "proxy" => Ok(CacheMode::Redis),
      _ => Err(format!("Unknown cache mode: {}", s)),
    }
  }
}

/// Connection settings for the Redis backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_redis_port")]
  pub port: u16,

  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
    }
  }
}

impl RedisConfig {
  pub fn is_configured(&self) -> bool {
    !self.host.is_empty()
  }

  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", urlencoding::encode(pwd)),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}

/// Query cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub mode: CacheMode,

  /// TTL of cached pages in seconds
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,

  /// Upper bound on a single cache round trip; slower calls count as misses
  #[serde(default = "default_op_timeout_ms")]
  pub op_timeout_ms: u64,

  /// Upper bound on a whole namespace eviction, which may take several
  /// round trips
  #[serde(default = "default_eviction_timeout_ms")]
  pub eviction_timeout_ms: u64,

  /// Interval of the builtin store's expiry sweep
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,

  /// Application prefix placed before every namespace (e.g. "product-system")
  #[serde(default)]
  pub key_prefix: String,

  #[serde(default)]
  pub invalidation: InvalidationOrder,

  #[serde(default)]
  pub redis: RedisConfig,
}

fn default_ttl_secs() -> u64 {
  1800 // 30 minutes
}

fn default_op_timeout_ms() -> u64 {
  200
}

fn default_eviction_timeout_ms() -> u64 {
  5000
}

fn default_sweep_interval_secs() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      mode: CacheMode::default(),
      default_ttl_secs: default_ttl_secs(),
      op_timeout_ms: default_op_timeout_ms(),
      eviction_timeout_ms: default_eviction_timeout_ms(),
      sweep_interval_secs: default_sweep_interval_secs(),
      key_prefix: String::new(),
      invalidation: InvalidationOrder::default(),
      redis: RedisConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn op_timeout(&self) -> Duration {
    Duration::from_millis(self.op_timeout_ms)
  }

  pub fn eviction_timeout(&self) -> Duration {
    Duration::from_millis(self.eviction_timeout_ms)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}
