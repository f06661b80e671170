use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account status values stored in `users.status`.
pub const STATUS_DISABLED: i32 = 0;
pub const STATUS_ACTIVE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: i64,
  pub product_name: String,
  pub product_code: String,
  pub category: Option<String>,
  pub price: f64,
  pub stock: i32,
  pub description: Option<String>,
  pub image_url: Option<String>,
  pub status: i32,
  pub created_by: Option<i64>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Writable product fields, used for both create and update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductDraft {
  pub product_name: String,
  pub product_code: String,
  #[serde(default)]
  pub category: Option<String>,
  pub price: f64,
  #[serde(default)]
  pub stock: i32,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub image_url: Option<String>,
  /// Defaults to active when absent.
  #[serde(default)]
  pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: i64,
  pub username: String,
  pub email: Option<String>,
  pub phone: Option<String>,
  pub real_name: Option<String>,
  pub avatar: Option<String>,
  pub status: i32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
  pub fn is_active(&self) -> bool {
    self.status != STATUS_DISABLED
  }
}

/// Writable user fields. `password` is plaintext and only set when it should
/// change; `roles` replaces the user's role codes when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDraft {
  pub username: String,
  #[serde(default)]
  pub password: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub real_name: Option<String>,
  #[serde(default)]
  pub avatar: Option<String>,
  #[serde(default)]
  pub status: Option<i32>,
  #[serde(default)]
  pub roles: Option<Vec<String>>,
}

/// An authenticated identity and the authorities granted to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
  pub user_id: i64,
  pub username: String,
  pub authorities: Vec<String>,
}

/// A persisted remember-me grant. The series is fixed for the life of the
/// grant; the token value changes on every successful use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberMeToken {
  pub series: String,
  pub token: String,
  pub principal: String,
  pub last_used: DateTime<Utc>,
}

/// One audited administrative action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
  pub id: i64,
  pub username: String,
  /// Action name, e.g. `create_product`
  pub operation: String,
  /// Affected entities, e.g. `product:12` or `user:3,4`
  pub target: String,
  pub created_at: DateTime<Utc>,
}
