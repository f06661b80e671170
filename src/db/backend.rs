use async_trait::async_trait;
use chrono::{DateTime, Utc};

use types::{
  OperationLog, PageRequest, PageResult, Product, ProductDraft, RememberMeToken, User, UserDraft,
};

use super::sanitize::{
  escape_like, integer_filter, number_filter, text_filter, validate_filters, validate_offset,
  SqlSanitizeError,
};

/// Filters accepted by the product listing
pub const PRODUCT_FILTER_FIELDS: &[&str] = &["product_name", "category", "min_price", "max_price"];

/// Filters accepted by the user listing
pub const USER_FILTER_FIELDS: &[&str] = &["username", "email", "status"];

/// Filters accepted by the operation log listing
pub const OPERATION_LOG_FILTER_FIELDS: &[&str] = &["username", "operation"];

/// SQL dialect of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl SqlDialect {
  /// Placeholder for the `n`th (1-based) bound parameter
  pub fn placeholder(&self, n: usize) -> String {
    match self {
      Self::Postgres => format!("${}", n),
      Self::Sqlite => format!("?{}", n),
    }
  }
}

/// A bound parameter of a generated listing query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
  Text(String),
  Integer(i64),
  Real(f64),
}

/// WHERE clause plus parameters, shared by the count and page queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingQuery {
  pub clauses: Vec<String>,
  pub params: Vec<SqlParam>,
  pub limit: u64,
  pub offset: u64,
}

impl ListingQuery {
  fn new(request: &PageRequest) -> Result<Self, SqlSanitizeError> {
    validate_offset(request.offset())?;
    Ok(Self {
      clauses: Vec::new(),
      params: Vec::new(),
      limit: request.size() as u64,
      offset: request.offset(),
    })
  }

  fn push(&mut self, dialect: SqlDialect, column: &str, op: &str, param: SqlParam) {
    let mut placeholder = dialect.placeholder(self.params.len() + 1);
    // Postgres binds strictly; widen INTEGER columns to the i64 parameter.
    if dialect == SqlDialect::Postgres && matches!(param, SqlParam::Integer(_)) {
      placeholder.push_str("::BIGINT");
    }
    self.params.push(param);
    let clause = if op == "LIKE" {
      format!("{} LIKE {} ESCAPE '\\'", column, placeholder)
    } else {
      format!("{} {} {}", column, op, placeholder)
    };
    self.clauses.push(clause);
  }

  /// ` WHERE a AND b`, or an empty string without filters
  pub fn where_sql(&self) -> String {
    if self.clauses.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", self.clauses.join(" AND "))
    }
  }

  /// Build the product listing filter: name contains, exact category and an
  /// inclusive price range.
  pub fn products(dialect: SqlDialect, request: &PageRequest) -> Result<Self, SqlSanitizeError> {
    validate_filters(request, PRODUCT_FILTER_FIELDS)?;
    let mut query = Self::new(request)?;

    if let Some(name) = text_filter(request, "product_name")? {
      query.push(dialect, "product_name", "LIKE", SqlParam::Text(escape_like(&name)?));
    }
    if let Some(category) = text_filter(request, "category")? {
      query.push(dialect, "category", "=", SqlParam::Text(category));
    }
    if let Some(min) = number_filter(request, "min_price")? {
      query.push(dialect, "price", ">=", SqlParam::Real(min));
    }
    if let Some(max) = number_filter(request, "max_price")? {
      query.push(dialect, "price", "<=", SqlParam::Real(max));
    }
    Ok(query)
  }

  /// Build the user listing filter: username and email contain, exact status.
  pub fn users(dialect: SqlDialect, request: &PageRequest) -> Result<Self, SqlSanitizeError> {
    validate_filters(request, USER_FILTER_FIELDS)?;
    let mut query = Self::new(request)?;

    if let Some(username) = text_filter(request, "username")? {
      query.push(dialect, "username", "LIKE", SqlParam::Text(escape_like(&username)?));
    }
    if let Some(email) = text_filter(request, "email")? {
      query.push(dialect, "email", "LIKE", SqlParam::Text(escape_like(&email)?));
    }
    if let Some(status) = integer_filter(request, "status")? {
      query.push(dialect, "status", "=", SqlParam::Integer(status));
    }
    Ok(query)
  }

  /// Build the operation log filter: exact username and operation.
  pub fn operation_logs(
    dialect: SqlDialect,
    request: &PageRequest,
  ) -> Result<Self, SqlSanitizeError> {
    validate_filters(request, OPERATION_LOG_FILTER_FIELDS)?;
    let mut query = Self::new(request)?;

    if let Some(username) = text_filter(request, "username")? {
      query.push(dialect, "username", "=", SqlParam::Text(username));
    }
    if let Some(operation) = text_filter(request, "operation")? {
      query.push(dialect, "operation", "=", SqlParam::Text(operation));
    }
    Ok(query)
  }
}

/// Durable storage for the catalog, the user registry and remember-me grants.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
  fn dialect(&self) -> SqlDialect;
  async fn init_schema(&self) -> Result<(), anyhow::Error>;
  async fn drop_schema(&self) -> Result<(), anyhow::Error>;

  // Products
  async fn insert_product(
    &self,
    draft: &ProductDraft,
    created_by: Option<i64>,
  ) -> Result<Product, anyhow::Error>;
  async fn update_product(
    &self,
    id: i64,
    draft: &ProductDraft,
  ) -> Result<Option<Product>, anyhow::Error>;
  async fn delete_products(&self, ids: &[i64]) -> Result<u64, anyhow::Error>;
  async fn get_product(&self, id: i64) -> Result<Option<Product>, anyhow::Error>;
  /// Whether another product (not `exclude`) already uses `code`.
  async fn product_code_taken(
    &self,
    code: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error>;
  async fn list_products(&self, request: &PageRequest)
    -> Result<PageResult<Product>, anyhow::Error>;

  // Users
  async fn insert_user(&self, draft: &UserDraft, password_hash: &str)
    -> Result<User, anyhow::Error>;
  async fn update_user(
    &self,
    id: i64,
    draft: &UserDraft,
    password_hash: Option<&str>,
  ) -> Result<Option<User>, anyhow::Error>;
  /// Delete users with their role links, detaching their products. Returns the
  /// usernames that were removed.
  async fn delete_users(&self, ids: &[i64]) -> Result<Vec<String>, anyhow::Error>;
  async fn get_user(&self, id: i64) -> Result<Option<User>, anyhow::Error>;
  async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, anyhow::Error>;
  /// User together with the stored password hash
  async fn get_user_credentials(
    &self,
    username: &str,
  ) -> Result<Option<(User, String)>, anyhow::Error>;
  async fn username_taken(&self, username: &str, exclude: Option<i64>)
    -> Result<bool, anyhow::Error>;
  async fn list_users(&self, request: &PageRequest) -> Result<PageResult<User>, anyhow::Error>;
  async fn user_authorities(&self, user_id: i64) -> Result<Vec<String>, anyhow::Error>;
  async fn touch_last_login(&self, user_id: i64) -> Result<(), anyhow::Error>;

  // Audit trail (`operation_logs`)
  async fn insert_operation_log(
    &self,
    username: &str,
    operation: &str,
    target: &str,
  ) -> Result<OperationLog, anyhow::Error>;
  /// Newest entries first.
  async fn list_operation_logs(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<OperationLog>, anyhow::Error>;

  // Remember-me grants (`persistent_logins`)
  /// Returns false when the series already exists.
  async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<bool, anyhow::Error>;
  /// Returns false when the series does not exist.
  async fn update_remember_me_token(
    &self,
    series: &str,
    token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<bool, anyhow::Error>;
  /// Replace the token only if the stored value equals `expected`, returning
  /// the updated row. `None` means the series is missing or the token differs.
  async fn swap_remember_me_token(
    &self,
    series: &str,
    expected: &str,
    new_token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<Option<RememberMeToken>, anyhow::Error>;
  async fn get_remember_me_token(
    &self,
    series: &str,
  ) -> Result<Option<RememberMeToken>, anyhow::Error>;
  async fn delete_remember_me_series(&self, series: &str) -> Result<bool, anyhow::Error>;
  async fn delete_remember_me_tokens(&self, username: &str) -> Result<u64, anyhow::Error>;
  /// Remove grants last used before `before`.
  async fn delete_expired_remember_me_tokens(
    &self,
    before: DateTime<Utc>,
  ) -> Result<u64, anyhow::Error>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_product_listing_query() {
    let request = PageRequest::new(2, 20)
      .unwrap()
      .filter("product_name", "pho")
      .unwrap()
      .filter("min_price", 10.0)
      .unwrap()
      .filter("category", "A")
      .unwrap();
    let query = ListingQuery::products(SqlDialect::Postgres, &request).unwrap();
    assert_eq!(
      query.where_sql(),
      " WHERE product_name LIKE $1 ESCAPE '\\' AND category = $2 AND price >= $3"
    );
    assert_eq!(
      query.params,
      vec![
        SqlParam::Text("%pho%".into()),
        SqlParam::Text("A".into()),
        SqlParam::Real(10.0)
      ]
    );
    assert_eq!(query.limit, 20);
    assert_eq!(query.offset, 20);
  }

  #[test]
  fn test_user_listing_query() {
    let request = PageRequest::first(10)
      .unwrap()
      .filter("status", 1i64)
      .unwrap();
    let query = ListingQuery::users(SqlDialect::Sqlite, &request).unwrap();
    assert_eq!(query.where_sql(), " WHERE status = ?1");
    let query = ListingQuery::users(SqlDialect::Postgres, &request).unwrap();
    assert_eq!(query.where_sql(), " WHERE status = $1::BIGINT");
  }

  #[test]
  fn test_unknown_filter_is_rejected() {
    let request = PageRequest::first(10)
      .unwrap()
      .filter("username", "bob")
      .unwrap();
    assert_eq!(
      ListingQuery::products(SqlDialect::Sqlite, &request).unwrap_err(),
      SqlSanitizeError::UnknownFilter("username".into())
    );
  }

  #[test]
  fn test_operation_log_listing_query() {
    let request = PageRequest::first(10)
      .unwrap()
      .filter("operation", "delete_users")
      .unwrap()
      .filter("username", " alice ")
      .unwrap();
    let query = ListingQuery::operation_logs(SqlDialect::Sqlite, &request).unwrap();
    assert_eq!(query.where_sql(), " WHERE username = ?1 AND operation = ?2");
    assert_eq!(
      query.params,
      vec![
        SqlParam::Text("alice".into()),
        SqlParam::Text("delete_users".into())
      ]
    );
  }

  #[test]
  fn test_no_filters() {
    let request = PageRequest::first(10).unwrap();
    let query = ListingQuery::products(SqlDialect::Sqlite, &request).unwrap();
    assert_eq!(query.where_sql(), "");
    assert!(query.params.is_empty());
  }
}
