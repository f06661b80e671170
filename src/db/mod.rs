mod backend;
mod postgres;
pub mod sanitize;
mod sqlite;

pub use backend::{
  DatabaseBackend, ListingQuery, SqlDialect, SqlParam, OPERATION_LOG_FILTER_FIELDS,
  PRODUCT_FILTER_FIELDS, USER_FILTER_FIELDS,
};
pub use postgres::PostgresBackend;
pub use sanitize::{escape_like, validate_filters, SqlSanitizeError};
pub use sqlite::SqliteBackend;
