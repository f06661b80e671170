use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use types::{
  OperationLog, PageRequest, PageResult, Product, ProductDraft, RememberMeToken, User, UserDraft,
  STATUS_ACTIVE,
};

use super::backend::{DatabaseBackend, ListingQuery, SqlDialect, SqlParam};
use crate::auth::ROLE_USER;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    username VARCHAR(64) NOT NULL UNIQUE,
    password VARCHAR(255) NOT NULL,
    email VARCHAR(255),
    phone VARCHAR(32),
    real_name VARCHAR(64),
    avatar VARCHAR(512),
    status INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_login_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS roles (
    id BIGSERIAL PRIMARY KEY,
    role_code VARCHAR(64) NOT NULL UNIQUE,
    role_name VARCHAR(64) NOT NULL
);
INSERT INTO roles (role_code, role_name) VALUES ('ROLE_ADMIN', 'Administrator'), ('ROLE_USER', 'User')
ON CONFLICT (role_code) DO NOTHING;

CREATE TABLE IF NOT EXISTS user_roles (
    user_id BIGINT NOT NULL,
    role_id BIGINT NOT NULL,
    PRIMARY KEY (user_id, role_id)
);

CREATE TABLE IF NOT EXISTS products (
    id BIGSERIAL PRIMARY KEY,
    product_name VARCHAR(255) NOT NULL,
    product_code VARCHAR(64) NOT NULL UNIQUE,
    category VARCHAR(64),
    price DOUBLE PRECISION NOT NULL DEFAULT 0,
    stock INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    image_url VARCHAR(512),
    status INTEGER NOT NULL DEFAULT 1,
    created_by BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(category);
CREATE INDEX IF NOT EXISTS idx_products_created_at ON products(created_at);

CREATE TABLE IF NOT EXISTS persistent_logins (
    id BIGSERIAL PRIMARY KEY,
    username VARCHAR(64) NOT NULL,
    series VARCHAR(64) NOT NULL UNIQUE,
    token VARCHAR(64) NOT NULL,
    last_used TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_persistent_logins_username ON persistent_logins(username);

CREATE TABLE IF NOT EXISTS operation_logs (
    id BIGSERIAL PRIMARY KEY,
    username VARCHAR(64) NOT NULL,
    operation VARCHAR(64) NOT NULL,
    target VARCHAR(512) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_operation_logs_created_at ON operation_logs(created_at);
"#;

const PRODUCT_COLUMNS: &str = "id, product_name, product_code, category, price, stock, \
  description, image_url, status, created_by, created_at, updated_at";

const USER_COLUMNS: &str =
  "id, username, email, phone, real_name, avatar, status, created_at, updated_at, last_login_at";

const TOKEN_COLUMNS: &str = "username, series, token, last_used";

const OPERATION_LOG_COLUMNS: &str = "id, username, operation, target, created_at";

pub struct PostgresBackend {
  pool: Pool,
}

impl PostgresBackend {
  pub fn new(url: &str, max_connections: usize) -> Result<Self, anyhow::Error> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_connections.max(1)));
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    Ok(Self { pool })
  }
}

fn to_sql(param: &SqlParam) -> Box<dyn ToSql + Sync + Send> {
  match param {
    SqlParam::Text(s) => Box::new(s.clone()),
    SqlParam::Integer(i) => Box::new(*i),
    SqlParam::Real(f) => Box::new(*f),
  }
}

fn row_to_product(row: &Row) -> Result<Product, tokio_postgres::Error> {
  Ok(Product {
    id: row.try_get(0)?,
    product_name: row.try_get(1)?,
    product_code: row.try_get(2)?,
    category: row.try_get(3)?,
    price: row.try_get(4)?,
    stock: row.try_get(5)?,
    description: row.try_get(6)?,
    image_url: row.try_get(7)?,
    status: row.try_get(8)?,
    created_by: row.try_get(9)?,
    created_at: row.try_get(10)?,
    updated_at: row.try_get(11)?,
  })
}

fn row_to_operation_log(row: &Row) -> Result<OperationLog, tokio_postgres::Error> {
  Ok(OperationLog {
    id: row.try_get(0)?,
    username: row.try_get(1)?,
    operation: row.try_get(2)?,
    target: row.try_get(3)?,
    created_at: row.try_get(4)?,
  })
}

fn row_to_user(row: &Row) -> Result<User, tokio_postgres::Error> {
  Ok(User {
    id: row.try_get(0)?,
    username: row.try_get(1)?,
    email: row.try_get(2)?,
    phone: row.try_get(3)?,
    real_name: row.try_get(4)?,
    avatar: row.try_get(5)?,
    status: row.try_get(6)?,
    created_at: row.try_get(7)?,
    updated_at: row.try_get(8)?,
    last_login_at: row.try_get(9)?,
  })
}

fn row_to_token(row: &Row) -> Result<RememberMeToken, tokio_postgres::Error> {
  Ok(RememberMeToken {
    principal: row.try_get(0)?,
    series: row.try_get(1)?,
    token: row.try_get(2)?,
    last_used: row.try_get(3)?,
  })
}

async fn replace_roles(
  tx: &deadpool_postgres::Transaction<'_>,
  user_id: i64,
  roles: &[String],
) -> Result<(), tokio_postgres::Error> {
  tx.execute("DELETE FROM user_roles WHERE user_id = $1", &[&user_id])
    .await?;
  let roles = roles.to_vec();
  tx.execute(
    "INSERT INTO user_roles (user_id, role_id) SELECT $1, id FROM roles WHERE role_code = ANY($2) \
     ON CONFLICT DO NOTHING",
    &[&user_id, &roles],
  )
  .await?;
  Ok(())
}

impl PostgresBackend {
  async fn list_page<T>(
    &self,
    table: &str,
    columns: &str,
    query: ListingQuery,
    request: &PageRequest,
    map: fn(&Row) -> Result<T, tokio_postgres::Error>,
  ) -> Result<PageResult<T>, anyhow::Error> {
    let client = self.pool.get().await?;
    let params: Vec<Box<dyn ToSql + Sync + Send>> = query.params.iter().map(to_sql).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params
      .iter()
      .map(|p| p.as_ref() as &(dyn ToSql + Sync))
      .collect();
    let where_sql = query.where_sql();

    let count = client
      .query_one(
        &format!("SELECT COUNT(*) FROM {}{}", table, where_sql),
        &refs,
      )
      .await?;
    let total: i64 = count.try_get(0)?;
    let total = total as u64;

    let mut records = Vec::with_capacity(query.limit as usize);
    if total > query.offset {
      let sql = format!(
        "SELECT {} FROM {}{} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
        columns, table, where_sql, query.limit, query.offset
      );
      for row in client.query(&sql, &refs).await? {
        records.push(map(&row)?);
      }
    }
    Ok(PageResult::new(records, total, request.page(), request.size()))
  }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self.pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("PostgreSQL schema initialized");
    Ok(())
  }

  async fn drop_schema(&self) -> Result<(), anyhow::Error> {
    self
      .pool
      .get()
      .await?
      .batch_execute(
        "DROP TABLE IF EXISTS operation_logs; DROP TABLE IF EXISTS persistent_logins;
       DROP TABLE IF EXISTS products;
       DROP TABLE IF EXISTS user_roles; DROP TABLE IF EXISTS roles; DROP TABLE IF EXISTS users;",
      )
      .await?;
    Ok(())
  }

  async fn insert_product(
    &self,
    draft: &ProductDraft,
    created_by: Option<i64>,
  ) -> Result<Product, anyhow::Error> {
    let now = Utc::now();
    let status = draft.status.unwrap_or(STATUS_ACTIVE);
    let row = self
      .pool
      .get()
      .await?
      .query_one(
        &format!(
          "INSERT INTO products (product_name, product_code, category, price, stock, description, \
           image_url, status, created_by, created_at, updated_at) \
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) RETURNING {}",
          PRODUCT_COLUMNS
        ),
        &[
          &draft.product_name,
          &draft.product_code,
          &draft.category,
          &draft.price,
          &draft.stock,
          &draft.description,
          &draft.image_url,
          &status,
          &created_by,
          &now,
        ],
      )
      .await?;
    Ok(row_to_product(&row)?)
  }

  async fn update_product(
    &self,
    id: i64,
    draft: &ProductDraft,
  ) -> Result<Option<Product>, anyhow::Error> {
    let now = Utc::now();
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!(
          "UPDATE products SET product_name = $1, product_code = $2, category = $3, price = $4, \
           stock = $5, description = $6, image_url = $7, status = COALESCE($8, status), \
           updated_at = $9 WHERE id = $10 RETURNING {}",
          PRODUCT_COLUMNS
        ),
        &[
          &draft.product_name,
          &draft.product_code,
          &draft.category,
          &draft.price,
          &draft.stock,
          &draft.description,
          &draft.image_url,
          &draft.status,
          &now,
          &id,
        ],
      )
      .await?;
    Ok(row.as_ref().map(row_to_product).transpose()?)
  }

  async fn delete_products(&self, ids: &[i64]) -> Result<u64, anyhow::Error> {
    if ids.is_empty() {
      return Ok(0);
    }
    let ids = ids.to_vec();
    let removed = self
      .pool
      .get()
      .await?
      .execute("DELETE FROM products WHERE id = ANY($1)", &[&ids])
      .await?;
    Ok(removed)
  }

  async fn get_product(&self, id: i64) -> Result<Option<Product>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!("SELECT {} FROM products WHERE id = $1", PRODUCT_COLUMNS),
        &[&id],
      )
      .await?;
    Ok(row.as_ref().map(row_to_product).transpose()?)
  }

  async fn product_code_taken(
    &self,
    code: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        "SELECT 1 FROM products WHERE product_code = $1 AND ($2::BIGINT IS NULL OR id <> $2)",
        &[&code, &exclude],
      )
      .await?;
    Ok(row.is_some())
  }

  async fn list_products(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<Product>, anyhow::Error> {
    let query = ListingQuery::products(SqlDialect::Postgres, request)?;
    self
      .list_page("products", PRODUCT_COLUMNS, query, request, row_to_product)
      .await
  }

  async fn insert_user(
    &self,
    draft: &UserDraft,
    password_hash: &str,
  ) -> Result<User, anyhow::Error> {
    let now = Utc::now();
    let status = draft.status.unwrap_or(STATUS_ACTIVE);
    let roles = draft
      .roles
      .clone()
      .unwrap_or_else(|| vec![ROLE_USER.to_string()]);

    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;
    let row = tx
      .query_one(
        &format!(
          "INSERT INTO users (username, password, email, phone, real_name, avatar, status, \
           created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING {}",
          USER_COLUMNS
        ),
        &[
          &draft.username,
          &password_hash,
          &draft.email,
          &draft.phone,
          &draft.real_name,
          &draft.avatar,
          &status,
          &now,
        ],
      )
      .await?;
    let user = row_to_user(&row)?;
    replace_roles(&tx, user.id, &roles).await?;
    tx.commit().await?;
    Ok(user)
  }

  async fn update_user(
    &self,
    id: i64,
    draft: &UserDraft,
    password_hash: Option<&str>,
  ) -> Result<Option<User>, anyhow::Error> {
    let now = Utc::now();
    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;
    let row = tx
      .query_opt(
        &format!(
          "UPDATE users SET username = $1, email = $2, phone = $3, real_name = $4, avatar = $5, \
           status = COALESCE($6, status), password = COALESCE($7, password), updated_at = $8 \
           WHERE id = $9 RETURNING {}",
          USER_COLUMNS
        ),
        &[
          &draft.username,
          &draft.email,
          &draft.phone,
          &draft.real_name,
          &draft.avatar,
          &draft.status,
          &password_hash,
          &now,
          &id,
        ],
      )
      .await?;
    let user = row.as_ref().map(row_to_user).transpose()?;
    if let (Some(user), Some(roles)) = (&user, &draft.roles) {
      replace_roles(&tx, user.id, roles).await?;
    }
    tx.commit().await?;
    Ok(user)
  }

  async fn delete_users(&self, ids: &[i64]) -> Result<Vec<String>, anyhow::Error> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let ids = ids.to_vec();
    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;

    let usernames = tx
      .query("SELECT username FROM users WHERE id = ANY($1)", &[&ids])
      .await?
      .iter()
      .map(|row| row.try_get::<_, String>(0))
      .collect::<Result<Vec<_>, _>>()?;
    tx.execute(
      "UPDATE products SET created_by = NULL WHERE created_by = ANY($1)",
      &[&ids],
    )
    .await?;
    tx.execute("DELETE FROM user_roles WHERE user_id = ANY($1)", &[&ids])
      .await?;
    tx.execute("DELETE FROM users WHERE id = ANY($1)", &[&ids])
      .await?;
    tx.commit().await?;
    Ok(usernames)
  }

  async fn get_user(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS),
        &[&id],
      )
      .await?;
    Ok(row.as_ref().map(row_to_user).transpose()?)
  }

  async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS),
        &[&username],
      )
      .await?;
    Ok(row.as_ref().map(row_to_user).transpose()?)
  }

  async fn get_user_credentials(
    &self,
    username: &str,
  ) -> Result<Option<(User, String)>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!(
          "SELECT {}, password FROM users WHERE username = $1",
          USER_COLUMNS
        ),
        &[&username],
      )
      .await?;
    match row {
      Some(row) => Ok(Some((row_to_user(&row)?, row.try_get(10)?))),
      None => Ok(None),
    }
  }

  async fn username_taken(
    &self,
    username: &str,
    exclude: Option<i64>,
  ) -> Result<bool, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        "SELECT 1 FROM users WHERE username = $1 AND ($2::BIGINT IS NULL OR id <> $2)",
        &[&username, &exclude],
      )
      .await?;
    Ok(row.is_some())
  }

  async fn list_users(&self, request: &PageRequest) -> Result<PageResult<User>, anyhow::Error> {
    let query = ListingQuery::users(SqlDialect::Postgres, request)?;
    self
      .list_page("users", USER_COLUMNS, query, request, row_to_user)
      .await
  }

  async fn user_authorities(&self, user_id: i64) -> Result<Vec<String>, anyhow::Error> {
    let rows = self
      .pool
      .get()
      .await?
      .query(
        "SELECT r.role_code FROM user_roles ur JOIN roles r ON r.id = ur.role_id \
         WHERE ur.user_id = $1 ORDER BY r.role_code",
        &[&user_id],
      )
      .await?;
    Ok(
      rows
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<Result<Vec<_>, _>>()?,
    )
  }

  async fn touch_last_login(&self, user_id: i64) -> Result<(), anyhow::Error> {
    self
      .pool
      .get()
      .await?
      .execute(
        "UPDATE users SET last_login_at = $1 WHERE id = $2",
        &[&Utc::now(), &user_id],
      )
      .await?;
    Ok(())
  }

  async fn insert_operation_log(
    &self,
    username: &str,
    operation: &str,
    target: &str,
  ) -> Result<OperationLog, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_one(
        &format!(
          "INSERT INTO operation_logs (username, operation, target, created_at) \
           VALUES ($1, $2, $3, $4) RETURNING {}",
          OPERATION_LOG_COLUMNS
        ),
        &[&username, &operation, &target, &Utc::now()],
      )
      .await?;
    Ok(row_to_operation_log(&row)?)
  }

  async fn list_operation_logs(
    &self,
    request: &PageRequest,
  ) -> Result<PageResult<OperationLog>, anyhow::Error> {
    let query = ListingQuery::operation_logs(SqlDialect::Postgres, request)?;
    self
      .list_page(
        "operation_logs",
        OPERATION_LOG_COLUMNS,
        query,
        request,
        row_to_operation_log,
      )
      .await
  }

  async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<bool, anyhow::Error> {
    let inserted = self
      .pool
      .get()
      .await?
      .execute(
        "INSERT INTO persistent_logins (username, series, token, last_used) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (series) DO NOTHING",
        &[&token.principal, &token.series, &token.token, &token.last_used],
      )
      .await?;
    Ok(inserted == 1)
  }

  async fn update_remember_me_token(
    &self,
    series: &str,
    token: &str,
    used_at: DateTime<Utc>,
  ) -> Result<bool, anyhow::Error> {
    let updated = self
      .pool
      .get()
      .await?
      .execute(
        "UPDATE persistent_logins SET token = $1, last_used = $2 WHERE series = $3",
        &[&token, &used_at, &series],
      )
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
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!(
          "UPDATE persistent_logins SET token = $1, last_used = $2 \
           WHERE series = $3 AND token = $4 RETURNING {}",
          TOKEN_COLUMNS
        ),
        &[&new_token, &used_at, &series, &expected],
      )
      .await?;
    Ok(row.as_ref().map(row_to_token).transpose()?)
  }

  async fn get_remember_me_token(
    &self,
    series: &str,
  ) -> Result<Option<RememberMeToken>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        &format!(
          "SELECT {} FROM persistent_logins WHERE series = $1",
          TOKEN_COLUMNS
        ),
        &[&series],
      )
      .await?;
    Ok(row.as_ref().map(row_to_token).transpose()?)
  }

  async fn delete_remember_me_series(&self, series: &str) -> Result<bool, anyhow::Error> {
    let removed = self
      .pool
      .get()
      .await?
      .execute("DELETE FROM persistent_logins WHERE series = $1", &[&series])
      .await?;
    Ok(removed > 0)
  }

  async fn delete_remember_me_tokens(&self, username: &str) -> Result<u64, anyhow::Error> {
    let removed = self
      .pool
      .get()
      .await?
      .execute(
        "DELETE FROM persistent_logins WHERE username = $1",
        &[&username],
      )
      .await?;
    Ok(removed)
  }

  async fn delete_expired_remember_me_tokens(
    &self,
    before: DateTime<Utc>,
  ) -> Result<u64, anyhow::Error> {
    let removed = self
      .pool
      .get()
      .await?
      .execute(
        "DELETE FROM persistent_logins WHERE last_used < $1",
        &[&before],
      )
      .await?;
    Ok(removed)
  }
}
