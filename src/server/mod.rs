mod config;
mod daemon;

pub use config::{
  AuthSection, BackendType, LoggingSection, PostgresSection, RememberMeSection, ServerConfig,
  SqliteSection,
};
pub use daemon::Daemon;
