use std::sync::Arc;

use types::{
  OperationLog, PageRequest, PageResult, Principal, Product, ProductDraft, User, UserDraft,
  STATUS_DISABLED,
};

use super::{CachedQueryService, InvalidationOrder};
use crate::auth::{check_authority, AccessDenied, AuthError, SessionAuthority, ROLE_ADMIN};
use crate::cache::{QueryKeyCodec, ResultCache};
use crate::db::{
  validate_filters, DatabaseBackend, OPERATION_LOG_FILTER_FIELDS, PRODUCT_FILTER_FIELDS,
  USER_FILTER_FIELDS,
};
use crate::security::hash_password;

pub const PRODUCTS_NAMESPACE: &str = "products";
pub const USERS_NAMESPACE: &str = "users";

/// Filters of the product listing, in key order
pub const PRODUCT_FILTERS: &[&str] = PRODUCT_FILTER_FIELDS;
/// Filters of the user listing, in key order
pub const USER_FILTERS: &[&str] = USER_FILTER_FIELDS;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
  #[error(transparent)]
  AccessDenied(#[from] AccessDenied),
  #[error("{0} not found")]
  NotFound(String),
  #[error("product code already exists: {0}")]
  DuplicateCode(String),
  #[error("username already exists: {0}")]
  DuplicateUsername(String),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error("storage error: {0}")]
  Storage(#[source] anyhow::Error),
  /// The write committed but the user's remember-me grants could not be
  /// revoked.
  #[error("could not revoke sessions of {username}: {source}")]
  SessionRevocation { username: String, source: AuthError },
}

/// Product and user administration. Listings are served through the query
/// cache and every write evicts the namespaces it affects once it commits.
/// Writes are recorded in the operation log.
pub struct Catalog {
  backend: Arc<dyn DatabaseBackend>,
  products: CachedQueryService<Product>,
  users: CachedQueryService<User>,
  sessions: Arc<SessionAuthority>,
}

impl Catalog {
  pub fn new(
    backend: Arc<dyn DatabaseBackend>,
    cache: Arc<ResultCache>,
    sessions: Arc<SessionAuthority>,
    order: InvalidationOrder,
  ) -> Self {
    let products = CachedQueryService::new(
      cache.clone(),
      QueryKeyCodec::new(PRODUCTS_NAMESPACE).with_fields(PRODUCT_FILTERS.iter().copied()),
    )
    .with_invalidation_order(order);
    let users = CachedQueryService::new(
      cache,
      QueryKeyCodec::new(USERS_NAMESPACE).with_fields(USER_FILTERS.iter().copied()),
    )
    .with_invalidation_order(order);

    Self {
      backend,
      products,
      users,
      sessions,
    }
  }

  pub fn products(&self) -> &CachedQueryService<Product> {
    &self.products
  }

  pub fn users(&self) -> &CachedQueryService<User> {
    &self.users
  }

  pub async fn list_products(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<Product>, CatalogError> {
    validate_filters(request, PRODUCT_FILTERS)
      .map_err(|e| CatalogError::InvalidRequest(e.to_string()))?;
    let backend = self.backend.clone();
    self
      .products
      .query(request, |request| async move {
        backend.list_products(&request).await
      })
      .await
      .map_err(CatalogError::Storage)
  }

  pub async fn get_product(&self, id: i64) -> Result<Product, CatalogError> {
    self
      .backend
      .get_product(id)
      .await
      .map_err(CatalogError::Storage)?
      .ok_or_else(|| CatalogError::NotFound(format!("product {}", id)))
  }

  pub async fn create_product(
    &self,
    actor: &Principal,
    draft: ProductDraft,
  ) -> Result<Product, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_product(&draft)?;
    if self
      .backend
      .product_code_taken(&draft.product_code, None)
      .await
      .map_err(CatalogError::Storage)?
    {
      return Err(CatalogError::DuplicateCode(draft.product_code));
    }

    let product = self
      .products
      .mutate(async {
        self
          .backend
          .insert_product(&draft, Some(actor.user_id))
          .await
          .map_err(CatalogError::Storage)
      })
      .await?;
    tracing::info!(id = product.id, code = %product.product_code, by = %actor.username, "Product created");
    self
      .audit(actor, "create_product", format!("product:{}", product.id))
      .await;
    Ok(product)
  }

  pub async fn update_product(
    &self,
    actor: &Principal,
    id: i64,
    draft: ProductDraft,
  ) -> Result<Product, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_product(&draft)?;
    if self
      .backend
      .product_code_taken(&draft.product_code, Some(id))
      .await
      .map_err(CatalogError::Storage)?
    {
      return Err(CatalogError::DuplicateCode(draft.product_code));
    }

    let product = self
      .products
      .mutate(async {
        self
          .backend
          .update_product(id, &draft)
          .await
          .map_err(CatalogError::Storage)?
          .ok_or_else(|| CatalogError::NotFound(format!("product {}", id)))
      })
      .await?;
    self.audit(actor, "update_product", format!("product:{}", id)).await;
    Ok(product)
  }

  /// Delete products by id, returning how many existed.
  pub async fn delete_products(
    &self,
    actor: &Principal,
    ids: &[i64],
  ) -> Result<u64, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    if ids.is_empty() {
      return Err(CatalogError::InvalidRequest("no product ids given".into()));
    }

    let removed = self
      .products
      .mutate(async {
        self
          .backend
          .delete_products(ids)
          .await
          .map_err(CatalogError::Storage)
      })
      .await?;
    tracing::info!(removed, by = %actor.username, "Products deleted");
    self
      .audit(actor, "delete_products", format!("product:{}", join_ids(ids)))
      .await;
    Ok(removed)
  }

  pub async fn list_users(
    &self,
    actor: &Principal,
    request: &PageRequest,
  ) -> Result<PageResult<User>, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_filters(request, USER_FILTERS)
      .map_err(|e| CatalogError::InvalidRequest(e.to_string()))?;
    let backend = self.backend.clone();
    self
      .users
      .query(request, |request| async move {
        backend.list_users(&request).await
      })
      .await
      .map_err(CatalogError::Storage)
  }

  pub async fn create_user(&self, actor: &Principal, draft: UserDraft) -> Result<User, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_user(&draft)?;
    let password = draft
      .password
      .as_deref()
      .filter(|p| !p.is_empty())
      .ok_or_else(|| CatalogError::InvalidRequest("password is required".into()))?;
    if self
      .backend
      .username_taken(&draft.username, None)
      .await
      .map_err(CatalogError::Storage)?
    {
      return Err(CatalogError::DuplicateUsername(draft.username));
    }
    let hash = hash_secret(password).await?;

    let user = self
      .users
      .mutate(async {
        self
          .backend
          .insert_user(&draft, &hash)
          .await
          .map_err(CatalogError::Storage)
      })
      .await?;
    tracing::info!(id = user.id, username = %user.username, by = %actor.username, "User created");
    self.audit(actor, "create_user", format!("user:{}", user.id)).await;
    Ok(user)
  }

  pub async fn update_user(
    &self,
    actor: &Principal,
    id: i64,
    draft: UserDraft,
  ) -> Result<User, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_user(&draft)?;
    if self
      .backend
      .username_taken(&draft.username, Some(id))
      .await
      .map_err(CatalogError::Storage)?
    {
      return Err(CatalogError::DuplicateUsername(draft.username));
    }
    let hash = match draft.password.as_deref().filter(|p| !p.is_empty()) {
      Some(password) => Some(hash_secret(password).await?),
      None => None,
    };

    let user = self
      .users
      .mutate(async {
        self
          .backend
          .update_user(id, &draft, hash.as_deref())
          .await
          .map_err(CatalogError::Storage)?
          .ok_or_else(|| CatalogError::NotFound(format!("user {}", id)))
      })
      .await?;
    self.audit(actor, "update_user", format!("user:{}", id)).await;

    // A disabled account keeps no session and no remember-me grant.
    if draft.status == Some(STATUS_DISABLED) {
      self.end_sessions(&user.username).await?;
    }
    Ok(user)
  }

  /// Delete users, detach their products and end their sessions everywhere.
  /// Returns the removed usernames.
  ///
  /// Revocation is attempted for every removed user. If any attempt fails the
  /// first failure is returned; the users stay deleted.
  pub async fn delete_users(
    &self,
    actor: &Principal,
    ids: &[i64],
  ) -> Result<Vec<String>, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    if ids.is_empty() {
      return Err(CatalogError::InvalidRequest("no user ids given".into()));
    }
    if ids.contains(&actor.user_id) {
      return Err(CatalogError::InvalidRequest("cannot delete the current user".into()));
    }

    let removed = self
      .users
      .mutate(async {
        self
          .backend
          .delete_users(ids)
          .await
          .map_err(CatalogError::Storage)
      })
      .await?;

    // Cached product pages carry `created_by`, which the delete cleared.
    if !removed.is_empty() {
      self.products.invalidate_on_mutation().await;
    }
    tracing::info!(removed = removed.len(), by = %actor.username, "Users deleted");
    self
      .audit(actor, "delete_users", format!("user:{}", join_ids(ids)))
      .await;

    let mut first_failure = None;
    for username in &removed {
      if let Err(e) = self.end_sessions(username).await {
        first_failure.get_or_insert(e);
      }
    }
    match first_failure {
      Some(e) => Err(e),
      None => Ok(removed),
    }
  }

  /// Audit trail of administrative writes, newest first. Not cached.
  pub async fn list_operation_logs(
    &self,
    actor: &Principal,
    request: &PageRequest,
  ) -> Result<PageResult<OperationLog>, CatalogError> {
    check_authority(&actor.authorities, ROLE_ADMIN)?;
    validate_filters(request, OPERATION_LOG_FILTER_FIELDS)
      .map_err(|e| CatalogError::InvalidRequest(e.to_string()))?;
    self
      .backend
      .list_operation_logs(request)
      .await
      .map_err(CatalogError::Storage)
  }

  /// Evict a namespace by its unqualified name. Unknown names evict nothing.
  pub async fn invalidate(&self, namespace: &str) -> usize {
    match namespace {
      PRODUCTS_NAMESPACE => self.products.invalidate_on_mutation().await,
      USERS_NAMESPACE => self.users.invalidate_on_mutation().await,
      _ => 0,
    }
  }

  async fn end_sessions(&self, username: &str) -> Result<(), CatalogError> {
    match self.sessions.logout_everywhere(username).await {
      Ok(_) => Ok(()),
      Err(source) => {
        tracing::error!(username = %username, error = %source, "Failed to revoke remember-me grants");
        Err(CatalogError::SessionRevocation {
          username: username.to_string(),
          source,
        })
      }
    }
  }

  /// Record a committed write. A failed insert is logged and does not fail
  /// the write.
  async fn audit(&self, actor: &Principal, operation: &str, target: String) {
    if let Err(e) = self
      .backend
      .insert_operation_log(&actor.username, operation, &target)
      .await
    {
      tracing::warn!(operation, target = %target, error = %e, "Failed to record operation log");
    }
  }
}

fn join_ids(ids: &[i64]) -> String {
  ids
    .iter()
    .map(|id| id.to_string())
    .collect::<Vec<_>>()
    .join(",")
}

fn validate_product(draft: &ProductDraft) -> Result<(), CatalogError> {
  if draft.product_name.trim().is_empty() {
    return Err(CatalogError::InvalidRequest("product name is required".into()));
  }
  if draft.product_code.trim().is_empty() {
    return Err(CatalogError::InvalidRequest("product code is required".into()));
  }
  if !draft.price.is_finite() || draft.price < 0.0 {
    return Err(CatalogError::InvalidRequest(format!(
      "invalid price: {}",
      draft.price
    )));
  }
  if draft.stock < 0 {
    return Err(CatalogError::InvalidRequest(format!(
      "invalid stock: {}",
      draft.stock
    )));
  }
  Ok(())
}

fn validate_user(draft: &UserDraft) -> Result<(), CatalogError> {
  if draft.username.trim().is_empty() {
    return Err(CatalogError::InvalidRequest("username is required".into()));
  }
  Ok(())
}

async fn hash_secret(password: &str) -> Result<String, CatalogError> {
  let password = password.to_string();
  tokio::task::spawn_blocking(move || hash_password(&password))
    .await
    .map_err(|e| CatalogError::Storage(e.into()))?
    .map_err(|e| CatalogError::Storage(anyhow::anyhow!("password hashing failed: {}", e)))
}
