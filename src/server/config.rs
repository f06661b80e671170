use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheConfig;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  // Handle ${VAR_NAME} syntax first (more specific)
  while let Some(start) = result.find("${") {
    if let Some(end) = result[start..].find('}') {
      let var_name = &result[start + 2..start + end];
      let value = std::env::var(var_name).unwrap_or_default();
      result = format!(
        "{}{}{}",
        &result[..start],
        value,
        &result[start + end + 1..]
      );
    } else {
      break;
    }
  }

  // Handle $VAR_NAME syntax (word boundary: alphanumeric + underscore)
  let mut i = 0;
  while i < result.len() {
    if result[i..].starts_with('$') && !result[i..].starts_with("${") {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let var_name = &rest[..var_len];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  Postgres,
  #[default]
  Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub postgres: PostgresSection,
  #[serde(default)]
  pub sqlite: SqliteSection,
  #[serde(default)]
  pub logging: LoggingSection,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub auth: AuthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
  #[serde(default)]
  pub remember_me: RememberMeSection,
  /// Upper bound on a single token store call
  #[serde(default = "default_token_store_timeout_ms")]
  pub token_store_timeout_ms: u64,
}

fn default_token_store_timeout_ms() -> u64 {
  2000
}

impl Default for AuthSection {
  fn default() -> Self {
    Self {
      remember_me: RememberMeSection::default(),
      token_store_timeout_ms: default_token_store_timeout_ms(),
    }
  }
}

impl AuthSection {
  pub fn token_store_timeout(&self) -> Duration {
    Duration::from_millis(self.token_store_timeout_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RememberMeSection {
  /// Seconds an unused grant stays valid
  #[serde(default = "default_validity_secs")]
  pub validity_secs: u64,
  /// Interval of the expired grant purge (0 = disabled)
  #[serde(default = "default_purge_interval_secs")]
  pub purge_interval_secs: u64,
}

fn default_validity_secs() -> u64 {
  86400 // 1 day
}

fn default_purge_interval_secs() -> u64 {
  3600
}

impl Default for RememberMeSection {
  fn default() -> Self {
    Self {
      validity_secs: default_validity_secs(),
      purge_interval_secs: default_purge_interval_secs(),
    }
  }
}

impl RememberMeSection {
  pub fn validity(&self) -> Duration {
    Duration::from_secs(self.validity_secs)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSection {
  #[serde(default = "default_pg_url")]
  pub url: String,
  #[serde(default = "default_max_conn")]
  pub max_connections: usize,
}
fn default_pg_url() -> String {
  "postgres://localhost/catalog".into()
}
fn default_max_conn() -> usize {
  20
}
impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      url: default_pg_url(),
      max_connections: default_max_conn(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
  #[serde(default = "default_sqlite_path")]
  pub path: String,
}
fn default_sqlite_path() -> String {
  "catalog.db".into()
}
impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: default_sqlite_path(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ServerConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["catalogd.yaml", "catalogd.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}
