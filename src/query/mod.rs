//! Cached listing paths
//!
//! [`CachedQueryService`] wraps one query family (a namespace) with
//! read-through caching and write-path invalidation. [`Catalog`] wires the
//! product and user listings through it.

mod catalog;
mod service;

use serde::{Deserialize, Serialize};

pub use catalog::{
  Catalog, CatalogError, PRODUCTS_NAMESPACE, PRODUCT_FILTERS, USERS_NAMESPACE, USER_FILTERS,
};
pub use service::CachedQueryService;

/// When a mutation evicts its namespace relative to the write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationOrder {
  /// Evict once the write has committed
  #[default]
  AfterCommit,
  /// Evict before the write and again after it, even when it fails
  BeforeAndAfter,
}

impl std::fmt::Display for InvalidationOrder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      InvalidationOrder::AfterCommit => write!(f, "after_commit"),
      InvalidationOrder::BeforeAndAfter => write!(f, "before_and_after"),
    }
  }
}

impl std::str::FromStr for InvalidationOrder {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace('-', "_").as_str() {
      "after_commit" | "after" => Ok(InvalidationOrder::AfterCommit),
      "before_and_after" | "both" => Ok(InvalidationOrder::BeforeAndAfter),
      _ => Err(format!("Unknown invalidation order: {}", s)),
    }
  }
}
