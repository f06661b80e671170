//! SQLite backend whose remember-me grant calls can be made to fail or hang.

#![allow(dead_code)]

use async_trait::async_trait;
use catalogd::db::{DatabaseBackend, SqlDialect, SqliteBackend};
use catalogd::types::{
  OperationLog, PageRequest, PageResult, Product, ProductDraft, RememberMeToken, User, UserDraft,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct FlakyBackend {
  inner: SqliteBackend,
  /// Grant calls return an error
  pub fail_tokens: AtomicBool,
  /// Grant calls never complete
  pub stall_tokens: AtomicBool,
}

impl FlakyBackend {
  pub async fn new() -> Self {
    let inner = SqliteBackend::in_memory().await.unwrap();
    inner.init_schema().await.unwrap();
    Self {
      inner,
      fail_tokens: AtomicBool::new(false),
      stall_tokens: AtomicBool::new(false),
    }
  }

  pub fn fail(&self, on: bool) {
    self.fail_tokens.store(on, Ordering::SeqCst);
  }

  pub fn stall(&self, on: bool) {
    self.stall_tokens.store(on, Ordering::SeqCst);
  }

  async fn token_call(&self) -> Result<(), anyhow::Error> {
    if self.stall_tokens.load(Ordering::SeqCst) {
      tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    if self.fail_tokens.load(Ordering::SeqCst) {
      anyhow::bail!("persistent_logins unavailable");
    }
    Ok(())
  }
}

#[async_trait]
impl DatabaseBackend for FlakyBackend {
  fn dialect(&self) -> SqlDialect {
    self.inner.dialect()
  }
  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self.inner.init_schema().await
  }
  async fn drop_schema(&self) -> Result<(), anyhow::Error> {
    self.inner.drop_schema().await
  }

  async fn insert_product(
    &self,
    draft: &ProductDraft,
    created_by: Option<i64>,
  ) -> Result<Product, anyhow::Error> {
    self.inner.insert_product(draft, created_by).await
  }
  async fn update_product(
    &self,
    id: i64,
    draft: &ProductDraft,
  ) -> Result<Option<Product>, anyhow::Error> {
    self.inner.update_product(id, draft).await
  }
  async fn delete_products(&self, ids: &[i64]) -> Result<u64, anyhow::Error> {
    self.inner.delete_products(ids).await
  }
  async fn get_product(&self, id: i64) -> Result<Option<Product>, anyhow::Error> {
    self.inner.get_product(id).await
  }
  async fn product_code_taken(
    &self,
    code: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    self.inner.product_code_taken(code, exclude).await
  }
  async fn list_products(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<Product>, anyhow::Error> {
    self.inner.list_products(request).await
  }

  async fn insert_user(
    &self,
    draft: &UserDraft,
    password_hash: &str,
  ) -> Result<User, anyhow::Error> {
    self.inner.insert_user(draft, password_hash).await
  }
  async fn update_user(
    &self,
    id: i64,
    draft: &UserDraft,
    password_hash: Option<&str>,
  ) -> Result<Option<User>, anyhow::Error> {
    self.inner.update_user(id, draft, password_hash).await
  }
  async fn delete_users(&self, ids: &[i64]) -> Result<Vec<String>, anyhow::Error> {
    self.inner.delete_users(ids).await
  }
  async fn get_user(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
    self.inner.get_user(id).await
  }
  async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, anyhow::Error> {
    self.inner.get_user_by_username(username).await
  }
  async fn get_user_credentials(
    &self,
    username: &str,
  ) -> Result<Option<(User, String)>, anyhow::Error> {
    self.inner.get_user_credentials(username).await
  }
  async fn username_taken(
    &self,
    username: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    self.inner.username_taken(username, exclude).await
  }
  async fn list_users(&self, request: &PageRequest) -> Result<PageResult<User>, anyhow::Error> {
    self.inner.list_users(request).await
  }
  async fn user_authorities(&self, user_id: i64) -> Result<Vec<String>, anyhow::Error> {
    self.inner.user_authorities(user_id).await
  }
  async fn touch_last_login(&self, user_id: i64) -> Result<(), anyhow::Error> {
    self.inner.touch_last_login(user_id).await
  }

  async fn insert_operation_log(
    &self,
    username: &str,
    operation: &str,
    target: &str,
  ) -> Result<OperationLog, anyhow::Error> {
    self.inner.insert_operation_log(username, operation, target).await
  }
  async fn list_operation_logs(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<OperationLog>, anyhow::Error> {
    self.inner.list_operation_logs(request).await
  }

  async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<bool, anyhow::Error> {
    self.token_call().await?;
    self.inner.insert_remember_me_token(token).await
  }
  async fn update_remember_me_token(
    &self,
    series: &str,
    token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<bool, anyhow::Error> {
    self.token_call().await?;
    self.inner.update_remember_me_token(series, token, used_at).await
  }
  async fn swap_remember_me_token(
    &self,
    series: &str,
    expected: &str,
    new_token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<Option<RememberMeToken>, anyhow::Error> {
    self.token_call().await?;
    self
      .inner
      .swap_remember_me_token(series, expected, new_token, used_at)
      .await
  }
  async fn get_remember_me_token(
    &self,
    series: &str,
  ) -> Result<Option<RememberMeToken>, anyhow::Error> {
    self.token_call().await?;
    self.inner.get_remember_me_token(series).await
  }
  async fn delete_remember_me_series(&self, series: &str) -> Result<bool, anyhow::Error> {
    self.token_call().await?;
    self.inner.delete_remember_me_series(series).await
  }
  async fn delete_remember_me_tokens(&self, username: &str) -> Result<u64, anyhow::Error> {
    self.token_call().await?;
    self.inner.delete_remember_me_tokens(username).await
  }
  async fn delete_expired_remember_me_tokens(
    &self,
    before: DateTime<Utc>,
  ) -> Result<u64, anyhow::Error> {
    self.token_call().await?;
    self.inner.delete_expired_remember_me_tokens(before).await
  }
}
