use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use tokio_rusqlite::Connection;

use types::{
  OperationLog, PageRequest, PageResult, Product, ProductDraft, RememberMeToken, User, UserDraft,
  STATUS_ACTIVE,
};

use super::backend::{DatabaseBackend, ListingQuery, SqlDialect, SqlParam};
use crate::auth::ROLE_USER;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    real_name TEXT,
    avatar TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_login_at TEXT
);

CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role_code TEXT NOT NULL UNIQUE,
    role_name TEXT NOT NULL
);
INSERT OR IGNORE INTO roles (role_code, role_name) VALUES ('ROLE_ADMIN', 'Administrator');
INSERT OR IGNORE INTO roles (role_code, role_name) VALUES ('ROLE_USER', 'User');

CREATE TABLE IF NOT EXISTS user_roles (
    user_id INTEGER NOT NULL,
    role_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, role_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_name TEXT NOT NULL,
    product_code TEXT NOT NULL UNIQUE,
    category TEXT,
    price REAL NOT NULL DEFAULT 0,
    stock INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    image_url TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    created_by INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(category);
CREATE INDEX IF NOT EXISTS idx_products_created_at ON products(created_at);

CREATE TABLE IF NOT EXISTS persistent_logins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    series TEXT NOT NULL UNIQUE,
    token TEXT NOT NULL,
    last_used TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_persistent_logins_username ON persistent_logins(username);

CREATE TABLE IF NOT EXISTS operation_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    operation TEXT NOT NULL,
    target TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_operation_logs_created_at ON operation_logs(created_at);
"#;

const PRODUCT_COLUMNS: &str = "id, product_name, product_code, category, price, stock, \
  description, image_url, status, created_by, created_at, updated_at";

const USER_COLUMNS: &str =
  "id, username, email, phone, real_name, avatar, status, created_at, updated_at, last_login_at";

const TOKEN_COLUMNS: &str = "username, series, token, last_used";

const OPERATION_LOG_COLUMNS: &str = "id, username, operation, target, created_at";

pub struct SqliteBackend {
  conn: Connection,
}

impl SqliteBackend {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };

    // Apply performance pragmas
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await?;

    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }
}

/// Fixed-width UTC text, so timestamps sort lexically.
fn ts(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
  DateTime::parse_from_rfc3339(s)
    .map(|d| d.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_value(param: &SqlParam) -> Value {
  match param {
    SqlParam::Text(s) => Value::Text(s.clone()),
    SqlParam::Integer(i) => Value::Integer(*i),
    SqlParam::Real(f) => Value::Real(*f),
  }
}

/// `?1, ?2, ...` for an IN list
fn in_list(n: usize) -> String {
  (1..=n)
    .map(|i| format!("?{}", i))
    .collect::<Vec<_>>()
    .join(", ")
}

fn row_to_product(row: &rusqlite::Row) -> Result<Product, rusqlite::Error> {
  let created_at: String = row.get(10)?;
  let updated_at: String = row.get(11)?;
  Ok(Product {
    id: row.get(0)?,
    product_name: row.get(1)?,
    product_code: row.get(2)?,
    category: row.get(3)?,
    price: row.get(4)?,
    stock: row.get(5)?,
    description: row.get(6)?,
    image_url: row.get(7)?,
    status: row.get(8)?,
    created_by: row.get(9)?,
    created_at: parse_ts(10, &created_at)?,
    updated_at: parse_ts(11, &updated_at)?,
  })
}

fn row_to_user(row: &rusqlite::Row) -> Result<User, rusqlite::Error> {
  let created_at: String = row.get(7)?;
  let updated_at: String = row.get(8)?;
  let last_login_at: Option<String> = row.get(9)?;
  Ok(User {
    id: row.get(0)?,
    username: row.get(1)?,
    email: row.get(2)?,
    phone: row.get(3)?,
    real_name: row.get(4)?,
    avatar: row.get(5)?,
    status: row.get(6)?,
    created_at: parse_ts(7, &created_at)?,
    updated_at: parse_ts(8, &updated_at)?,
    last_login_at: last_login_at.map(|s| parse_ts(9, &s)).transpose()?,
  })
}

fn row_to_token(row: &rusqlite::Row) -> Result<RememberMeToken, rusqlite::Error> {
  let last_used: String = row.get(3)?;
  Ok(RememberMeToken {
    principal: row.get(0)?,
    series: row.get(1)?,
    token: row.get(2)?,
    last_used: parse_ts(3, &last_used)?,
  })
}

fn row_to_operation_log(row: &rusqlite::Row) -> Result<OperationLog, rusqlite::Error> {
  let created_at: String = row.get(4)?;
  Ok(OperationLog {
    id: row.get(0)?,
    username: row.get(1)?,
    operation: row.get(2)?,
    target: row.get(3)?,
    created_at: parse_ts(4, &created_at)?,
  })
}

fn replace_roles(tx: &Transaction, user_id: i64, roles: &[String]) -> Result<(), rusqlite::Error> {
  tx.execute("DELETE FROM user_roles WHERE user_id = ?1", params![user_id])?;
  let mut stmt = tx.prepare_cached(
    "INSERT OR IGNORE INTO user_roles (user_id, role_id) SELECT ?1, id FROM roles WHERE role_code = ?2",
  )?;
  for role in roles {
    stmt.execute(params![user_id, role])?;
  }
  Ok(())
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    tracing::info!("SQLite schema initialized");
    Ok(())
  }

  async fn drop_schema(&self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| {
        conn
          .execute_batch(
            "DROP TABLE IF EXISTS operation_logs;
         DROP TABLE IF EXISTS persistent_logins;
         DROP TABLE IF EXISTS products;
         DROP TABLE IF EXISTS user_roles;
         DROP TABLE IF EXISTS roles;
         DROP TABLE IF EXISTS users;",
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn insert_product(
    &self,
    draft: &ProductDraft,
    created_by: Option<i64>,
  ) -> Result<Product, anyhow::Error> {
    let draft = draft.clone();
    let now = ts(Utc::now());
    let sql = format!(
      "INSERT INTO products (product_name, product_code, category, price, stock, description, \
       image_url, status, created_by, created_at, updated_at) \
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) RETURNING {}",
      PRODUCT_COLUMNS
    );

    self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &sql,
            params![
              draft.product_name,
              draft.product_code,
              draft.category,
              draft.price,
              draft.stock,
              draft.description,
              draft.image_url,
              draft.status.unwrap_or(STATUS_ACTIVE),
              created_by,
              now
            ],
            row_to_product,
          )
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn update_product(
    &self,
    id: i64,
    draft: &ProductDraft,
  ) -> Result<Option<Product>, anyhow::Error> {
    let draft = draft.clone();
    let now = ts(Utc::now());
    let sql = format!(
      "UPDATE products SET product_name = ?1, product_code = ?2, category = ?3, price = ?4, \
       stock = ?5, description = ?6, image_url = ?7, status = COALESCE(?8, status), \
       updated_at = ?9 WHERE id = ?10 RETURNING {}",
      PRODUCT_COLUMNS
    );

    self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &sql,
            params![
              draft.product_name,
              draft.product_code,
              draft.category,
              draft.price,
              draft.stock,
              draft.description,
              draft.image_url,
              draft.status,
              now,
              id
            ],
            row_to_product,
          )
          .optional()
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn delete_products(&self, ids: &[i64]) -> Result<u64, anyhow::Error> {
    if ids.is_empty() {
      return Ok(0);
    }
    let ids = ids.to_vec();
    let sql = format!("DELETE FROM products WHERE id IN ({})", in_list(ids.len()));

    let removed = self
      .conn
      .call(move |conn| {
        conn
          .execute(&sql, params_from_iter(ids.iter()))
          .map_err(|e| e.into())
      })
      .await?;
    Ok(removed as u64)
  }

  async fn get_product(&self, id: i64) -> Result<Option<Product>, anyhow::Error> {
    let sql = format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLUMNS);
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![id], row_to_product).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn product_code_taken(
    &self,
    code: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    let code = code.to_string();
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT 1 FROM products WHERE product_code = ?1 AND (?2 IS NULL OR id != ?2)",
        )?;
        Ok(stmt.exists(params![code, exclude])?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn list_products(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<Product>, anyhow::Error> {
    let query = ListingQuery::products(SqlDialect::Sqlite, request)?;
    let (page, size) = (request.page(), request.size());

    self
      .conn
      .call(move |conn| {
        let values: Vec<Value> = query.params.iter().map(to_value).collect();
        let where_sql = query.where_sql();

        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM products{}", where_sql),
          params_from_iter(values.iter()),
          |row| row.get(0),
        )?;
        let total = total as u64;

        let mut records = Vec::with_capacity(query.limit as usize);
        if total > query.offset {
          let sql = format!(
            "SELECT {} FROM products{} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            PRODUCT_COLUMNS, where_sql, query.limit, query.offset
          );
          let mut stmt = conn.prepare(&sql)?;
          let mut rows = stmt.query(params_from_iter(values.iter()))?;
          while let Some(row) = rows.next()? {
            records.push(row_to_product(row)?);
          }
        }
        Ok(PageResult::new(records, total, page, size))
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn insert_user(
    &self,
    draft: &UserDraft,
    password_hash: &str,
  ) -> Result<User, anyhow::Error> {
    let draft = draft.clone();
    let password_hash = password_hash.to_string();
    let now = ts(Utc::now());
    let sql = format!(
      "INSERT INTO users (username, password, email, phone, real_name, avatar, status, \
       created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) RETURNING {}",
      USER_COLUMNS
    );

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let user = tx.query_row(
          &sql,
          params![
            draft.username,
            password_hash,
            draft.email,
            draft.phone,
            draft.real_name,
            draft.avatar,
            draft.status.unwrap_or(STATUS_ACTIVE),
            now
          ],
          row_to_user,
        )?;
        let roles = draft
          .roles
          .clone()
          .unwrap_or_else(|| vec![ROLE_USER.to_string()]);
        replace_roles(&tx, user.id, &roles)?;
        tx.commit()?;
        Ok(user)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn update_user(
    &self,
    id: i64,
    draft: &UserDraft,
    password_hash: Option<&str>,
  ) -> Result<Option<User>, anyhow::Error> {
    let draft = draft.clone();
    let password_hash = password_hash.map(str::to_string);
    let now = ts(Utc::now());
    let sql = format!(
      "UPDATE users SET username = ?1, email = ?2, phone = ?3, real_name = ?4, avatar = ?5, \
       status = COALESCE(?6, status), password = COALESCE(?7, password), updated_at = ?8 \
       WHERE id = ?9 RETURNING {}",
      USER_COLUMNS
    );

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let user = tx
          .query_row(
            &sql,
            params![
              draft.username,
              draft.email,
              draft.phone,
              draft.real_name,
              draft.avatar,
              draft.status,
              password_hash,
              now,
              id
            ],
            row_to_user,
          )
          .optional()?;
        if let (Some(user), Some(roles)) = (&user, &draft.roles) {
          replace_roles(&tx, user.id, roles)?;
        }
        tx.commit()?;
        Ok(user)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn delete_users(&self, ids: &[i64]) -> Result<Vec<String>, anyhow::Error> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let ids = ids.to_vec();
    let list = in_list(ids.len());

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let usernames = {
          let mut stmt = tx.prepare(&format!("SELECT username FROM users WHERE id IN ({})", list))?;
          let names = stmt
            .query_map(params_from_iter(ids.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
          names
        };
        tx.execute(
          &format!("UPDATE products SET created_by = NULL WHERE created_by IN ({})", list),
          params_from_iter(ids.iter()),
        )?;
        tx.execute(
          &format!("DELETE FROM user_roles WHERE user_id IN ({})", list),
          params_from_iter(ids.iter()),
        )?;
        tx.execute(
          &format!("DELETE FROM users WHERE id IN ({})", list),
          params_from_iter(ids.iter()),
        )?;
        tx.commit()?;
        Ok(usernames)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn get_user(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![id], row_to_user).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, anyhow::Error> {
    let username = username.to_string();
    let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![username], row_to_user).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn get_user_credentials(
    &self,
    username: &str,
  ) -> Result<Option<(User, String)>, anyhow::Error> {
    let username = username.to_string();
    let sql = format!(
      "SELECT {}, password FROM users WHERE username = ?1",
      USER_COLUMNS
    );
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let found = stmt
          .query_row(params![username], |row| {
            Ok((row_to_user(row)?, row.get::<_, String>(10)?))
          })
          .optional()?;
        Ok(found)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn username_taken(
    &self,
    username: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    let username = username.to_string();
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn
          .prepare_cached("SELECT 1 FROM users WHERE username = ?1 AND (?2 IS NULL OR id != ?2)")?;
        Ok(stmt.exists(params![username, exclude])?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn list_users(&self, request: &PageRequest) -> Result<PageResult<User>, anyhow::Error> {
    let query = ListingQuery::users(SqlDialect::Sqlite, request)?;
    let (page, size) = (request.page(), request.size());

    self
      .conn
      .call(move |conn| {
        let values: Vec<Value> = query.params.iter().map(to_value).collect();
        let where_sql = query.where_sql();

        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM users{}", where_sql),
          params_from_iter(values.iter()),
          |row| row.get(0),
        )?;
        let total = total as u64;

        let mut records = Vec::with_capacity(query.limit as usize);
        if total > query.offset {
          let sql = format!(
            "SELECT {} FROM users{} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            USER_COLUMNS, where_sql, query.limit, query.offset
          );
          let mut stmt = conn.prepare(&sql)?;
          let mut rows = stmt.query(params_from_iter(values.iter()))?;
          while let Some(row) = rows.next()? {
            records.push(row_to_user(row)?);
          }
        }
        Ok(PageResult::new(records, total, page, size))
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn user_authorities(&self, user_id: i64) -> Result<Vec<String>, anyhow::Error> {
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT r.role_code FROM user_roles ur JOIN roles r ON r.id = ur.role_id \
           WHERE ur.user_id = ?1 ORDER BY r.role_code",
        )?;
        let roles = stmt
          .query_map(params![user_id], |row| row.get::<_, String>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(roles)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn touch_last_login(&self, user_id: i64) -> Result<(), anyhow::Error> {
    let now = ts(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![now, user_id],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn insert_operation_log(
    &self,
    username: &str,
    operation: &str,
    target: &str,
  ) -> Result<OperationLog, anyhow::Error> {
    let (username, operation, target) =
      (username.to_string(), operation.to_string(), target.to_string());
    let now = ts(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &format!(
              "INSERT INTO operation_logs (username, operation, target, created_at) \
               VALUES (?1, ?2, ?3, ?4) RETURNING {}",
              OPERATION_LOG_COLUMNS
            ),
            params![username, operation, target, now],
            row_to_operation_log,
          )
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn list_operation_logs(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<OperationLog>, anyhow::Error> {
    let query = ListingQuery::operation_logs(SqlDialect::Sqlite, request)?;
    let (page, size) = (request.page(), request.size());

    self
      .conn
      .call(move |conn| {
        let values: Vec<Value> = query.params.iter().map(to_value).collect();
        let where_sql = query.where_sql();

        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM operation_logs{}", where_sql),
          params_from_iter(values.iter()),
          |row| row.get(0),
        )?;
        let total = total as u64;

        let mut records = Vec::with_capacity(query.limit as usize);
        if total > query.offset {
          let sql = format!(
            "SELECT {} FROM operation_logs{} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            OPERATION_LOG_COLUMNS, where_sql, query.limit, query.offset
          );
          let mut stmt = conn.prepare(&sql)?;
          let mut rows = stmt.query(params_from_iter(values.iter()))?;
          while let Some(row) = rows.next()? {
            records.push(row_to_operation_log(row)?);
          }
        }
        Ok(PageResult::new(records, total, page, size))
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<bool, anyhow::Error> {
    let token = token.clone();
    let inserted = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO persistent_logins (username, series, token, last_used) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(series) DO NOTHING",
            params![token.principal, token.series, token.token, ts(token.last_used)],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(inserted == 1)
  }

  async fn update_remember_me_token(
    &self,
    series: &str,
    token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<bool, anyhow::Error> {
    let (series, token) = (series.to_string(), token.to_string());
    let updated = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "UPDATE persistent_logins SET token = ?1, last_used = ?2 WHERE series = ?3",
            params![token, ts(used_at), series],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(updated > 0)
  }

  async fn swap_remember_me_token(
    &self,
    series: &str,
    expected: &str,
    new_token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<Option<RememberMeToken>, anyhow::Error> {
    let (series, expected, new_token) =
      (series.to_string(), expected.to_string(), new_token.to_string());
    let sql = format!(
      "UPDATE persistent_logins SET token = ?1, last_used = ?2 \
       WHERE series = ?3 AND token = ?4 RETURNING {}",
      TOKEN_COLUMNS
    );
    self
      .conn
      .call(move |conn| {
        conn
          .query_row(
            &sql,
            params![new_token, ts(used_at), series, expected],
            row_to_token,
          )
          .optional()
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn get_remember_me_token(
    &self,
    series: &str,
  ) -> Result<Option<RememberMeToken>, anyhow::Error> {
    let series = series.to_string();
    let sql = format!(
      "SELECT {} FROM persistent_logins WHERE series = ?1",
      TOKEN_COLUMNS
    );
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![series], row_to_token).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn delete_remember_me_series(&self, series: &str) -> Result<bool, anyhow::Error> {
    let series = series.to_string();
    let removed = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM persistent_logins WHERE series = ?1",
            params![series],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(removed > 0)
  }

  async fn delete_remember_me_tokens(&self, username: &str) -> Result<u64, anyhow::Error> {
    let username = username.to_string();
    let removed = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM persistent_logins WHERE username = ?1",
            params![username],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(removed as u64)
  }

  async fn delete_expired_remember_me_tokens(
    &self,
    before: DateTime<Utc>,
  ) -> Result<u64, anyhow::Error> {
    let cutoff = ts(before);
    let removed = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM persistent_logins WHERE last_used < ?1",
            params![cutoff],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(removed as u64)
  }
}
