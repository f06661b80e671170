//! Durable remember-me grants.
//!
//! Each grant is a `series` that stays fixed for its lifetime and a `token`
//! that changes on every use. The store holds whatever token value it is
//! given; callers decide whether that is a digest.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use types::RememberMeToken;

use crate::db::DatabaseBackend;

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
  #[error("remember-me series already exists")]
  DuplicateSeries,
  #[error("unknown remember-me series")]
  UnknownSeries,
  #[error("remember-me token does not match the stored value")]
  TokenMismatch,
  #[error("token storage failed: {0}")]
  Storage(#[source] anyhow::Error),
  #[error("token storage timed out after {0:?}")]
  Timeout(Duration),
}

pub struct PersistentTokenStore {
  backend: Arc<dyn DatabaseBackend>,
  timeout: Duration,
}

impl PersistentTokenStore {
  pub fn new(backend: Arc<dyn DatabaseBackend>, timeout: Duration) -> Self {
    Self { backend, timeout }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  async fn bounded<T, F>(&self, fut: F) -> Result<T, TokenStoreError>
  where
    F: Future<Output = Result<T, anyhow::Error>>,
  {
    match tokio::time::timeout(self.timeout, fut).await {
      Ok(result) => result.map_err(TokenStoreError::Storage),
      Err(_) => Err(TokenStoreError::Timeout(self.timeout)),
    }
  }

  /// Record a new grant for `principal`.
  pub async fn create_token(
    &self,
    principal: &str,
    series: &str,
    token: &str,
    issued_at: DateTime<Utc>,
  ) -> Result<RememberMeToken, TokenStoreError> {
    let record = RememberMeToken {
      series: series.to_string(),
      token: token.to_string(),
      principal: principal.to_string(),
      last_used: issued_at,
    };
    if self
      .bounded(self.backend.insert_remember_me_token(&record))
      .await?
    {
      Ok(record)
    } else {
      Err(TokenStoreError::DuplicateSeries)
    }
  }

  /// Replace the token of `series` unconditionally.
  pub async fn rotate_token(
    &self,
    series: &str,
    new_token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<(), TokenStoreError> {
    if self
      .bounded(
        self
          .backend
          .update_remember_me_token(series, new_token, used_at),
      )
      .await?
    {
      Ok(())
    } else {
      Err(TokenStoreError::UnknownSeries)
    }
  }

  /// Replace the token of `series` only if it still equals `presented`. Of
  /// several concurrent calls presenting the same token exactly one succeeds;
  /// the others see [`TokenStoreError::TokenMismatch`].
  pub async fn compare_and_rotate(
    &self,
    series: &str,
    presented: &str,
    new_token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<RememberMeToken, TokenStoreError> {
    let swapped = self
      .bounded(
        self
          .backend
          .swap_remember_me_token(series, presented, new_token, used_at),
      )
      .await?;
    if let Some(record) = swapped {
      return Ok(record);
    }

    match self.lookup(series).await? {
      Some(_) => Err(TokenStoreError::TokenMismatch),
      None => Err(TokenStoreError::UnknownSeries),
    }
  }

  pub async fn lookup(&self, series: &str) -> Result<Option<RememberMeToken>, TokenStoreError> {
    self
      .bounded(self.backend.get_remember_me_token(series))
      .await
  }

  /// Revoke a single grant. Returns whether it existed.
  pub async fn remove_series(&self, series: &str) -> Result<bool, TokenStoreError> {
    self
      .bounded(self.backend.delete_remember_me_series(series))
      .await
  }

  /// Revoke every grant of `principal`, returning how many were removed.
  pub async fn revoke_all(&self, principal: &str) -> Result<u64, TokenStoreError> {
    self
      .bounded(self.backend.delete_remember_me_tokens(principal))
      .await
  }

  /// Drop grants unused for longer than `validity`.
  pub async fn purge_expired(&self, validity: Duration) -> Result<u64, TokenStoreError> {
    let cutoff = chrono::Duration::from_std(validity)
      .ok()
      .and_then(|d| Utc::now().checked_sub_signed(d));
    let Some(cutoff) = cutoff else {
      return Ok(0);
    };
    self
      .bounded(self.backend.delete_expired_remember_me_tokens(cutoff))
      .await
  }
}
