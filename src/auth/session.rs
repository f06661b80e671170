//! Interactive sessions and remember-me logins.
//!
//! A principal holds at most one live session; establishing a new one replaces
//! the old. A remember-me grant is handed to the client as a
//! [`RememberMeCookie`] and stored as a SHA-256 digest. Every successful
//! auto-login rotates the token. Presenting a stale token for a live series is
//! treated as theft and revokes the series.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use types::Principal;

use super::authority::{check_authority, AccessDenied};
use super::token_store::{PersistentTokenStore, TokenStoreError};
use crate::security::{constant_time_compare, generate_secret, hash_sha256};

/// Checks a login form's identity and secret.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
  /// `Ok(None)` when the credentials are wrong or the account is disabled.
  async fn verify_credentials(
    &self,
    identity: &str,
    secret: &str,
  ) -> Result<Option<Principal>, anyhow::Error>;
}

/// Reloads a principal by name, for logins that carry no password.
#[async_trait]
pub trait PrincipalLoader: Send + Sync {
  /// `Ok(None)` when the principal no longer exists or may not log in.
  async fn load_principal(&self, username: &str) -> Result<Option<Principal>, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
  /// Logged in with credentials
  Interactive,
  /// Logged in with credentials and remember-me, or through a remember-me token
  Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Anonymous,
  Authenticated(AuthMode),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
  pub id: Uuid,
  pub principal: Principal,
  pub mode: AuthMode,
  /// Remember-me series bound to this session
  #[serde(skip_serializing_if = "Option::is_none")]
  pub series: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// Client-side half of a remember-me grant, carried as `<series>:<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberMeCookie {
  pub series: String,
  pub token: String,
}

impl RememberMeCookie {
  pub fn encode(&self) -> String {
    format!("{}:{}", self.series, self.token)
  }

  pub fn parse(value: &str) -> Option<Self> {
    let (series, token) = value.trim().split_once(':')?;
    let well_formed = |s: &str| !s.is_empty() && s.len() <= 128 && s.chars().all(|c| c.is_ascii_hexdigit());
    if well_formed(series) && well_formed(token) {
      Some(Self {
        series: series.to_string(),
        token: token.to_string(),
      })
    } else {
      None
    }
  }
}

/// A newly registered session and, for remember-me logins, the cookie the
/// client must present next time.
#[derive(Debug, Clone)]
pub struct SessionGrant {
  pub session: Session,
  pub remember_me: Option<RememberMeCookie>,
}

/// Why a remember-me token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
  Malformed,
  UnknownSeries,
  TokenTheft,
  Expired,
  PrincipalGone,
  StoreUnavailable,
}

impl std::fmt::Display for Reject {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Reject::Malformed => write!(f, "malformed cookie"),
      Reject::UnknownSeries => write!(f, "unknown series"),
      Reject::TokenTheft => write!(f, "token reuse detected"),
      Reject::Expired => write!(f, "grant expired"),
      Reject::PrincipalGone => write!(f, "principal no longer exists"),
      Reject::StoreUnavailable => write!(f, "token store unavailable"),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
  #[error("bad credentials")]
  BadCredentials,
  #[error("remember-me login rejected: {0}")]
  Rejected(Reject),
  #[error(transparent)]
  AccessDenied(#[from] AccessDenied),
  #[error(transparent)]
  TokenStore(#[from] TokenStoreError),
  #[error("credential check failed: {0}")]
  Backend(anyhow::Error),
}

#[derive(Default)]
struct Registry {
  by_id: HashMap<Uuid, Session>,
  by_principal: HashMap<String, Uuid>,
}

pub struct SessionAuthority {
  tokens: Arc<PersistentTokenStore>,
  credentials: Arc<dyn CredentialVerifier>,
  principals: Arc<dyn PrincipalLoader>,
  validity: Duration,
  registry: RwLock<Registry>,
}

impl SessionAuthority {
  pub fn new(
    tokens: Arc<PersistentTokenStore>,
    credentials: Arc<dyn CredentialVerifier>,
    principals: Arc<dyn PrincipalLoader>,
    validity: Duration,
  ) -> Self {
    Self {
      tokens,
      credentials,
      principals,
      validity,
      registry: RwLock::new(Registry::default()),
    }
  }

  pub fn token_store(&self) -> &Arc<PersistentTokenStore> {
    &self.tokens
  }

  /// How long an unused remember-me grant stays valid
  pub fn validity(&self) -> Duration {
    self.validity
  }

  pub async fn login(
    &self,
    identity: &str,
    secret: &str,
    remember_me: bool,
  ) -> Result<SessionGrant, AuthError> {
    let principal = self
      .credentials
      .verify_credentials(identity, secret)
      .await
      .map_err(AuthError::Backend)?;

    let Some(principal) = principal else {
      tracing::info!(identity = %identity, "Login failed");
      return Err(AuthError::BadCredentials);
    };
    self.establish_session(principal, remember_me).await
  }

  /// Register a session for an already authenticated principal, replacing
  /// any live session it has. With `remember_me` a new grant is stored first;
  /// if that fails no session is registered.
  pub async fn establish_session(
    &self,
    principal: Principal,
    remember_me: bool,
  ) -> Result<SessionGrant, AuthError> {
    let cookie = if remember_me {
      let cookie = RememberMeCookie {
        series: generate_secret(),
        token: generate_secret(),
      };
      self
        .tokens
        .create_token(
          &principal.username,
          &cookie.series,
          &hash_sha256(&cookie.token),
          Utc::now(),
        )
        .await?;
      Some(cookie)
    } else {
      None
    };

    let mode = if cookie.is_some() {
      AuthMode::Persistent
    } else {
      AuthMode::Interactive
    };
    let session = self.register(principal, mode, cookie.as_ref().map(|c| c.series.clone()));
    tracing::info!(
      principal = %session.principal.username,
      session = %session.id,
      remember_me,
      "Session established"
    );

    Ok(SessionGrant {
      session,
      remember_me: cookie,
    })
  }

  /// Log in with a remember-me cookie value.
  pub async fn validate_cookie(&self, cookie: &str) -> Result<SessionGrant, AuthError> {
    let Some(cookie) = RememberMeCookie::parse(cookie) else {
      return Err(AuthError::Rejected(Reject::Malformed));
    };
    self
      .validate_incoming_token(&cookie.series, &cookie.token)
      .await
  }

  /// Log in with a remember-me series and token. On success the token is
  /// rotated and the returned grant carries its replacement. Any failure
  /// rejects; nothing falls through to an authenticated state.
  pub async fn validate_incoming_token(
    &self,
    series: &str,
    token: &str,
  ) -> Result<SessionGrant, AuthError> {
    let record = match self.tokens.lookup(series).await {
      Ok(Some(record)) => record,
      Ok(None) => return Err(AuthError::Rejected(Reject::UnknownSeries)),
      Err(e) => return Err(self.store_failure(series, e)),
    };

    if self.is_expired(record.last_used) {
      tracing::debug!(series = %series, "Remember-me grant expired");
      if let Err(e) = self.tokens.remove_series(series).await {
        tracing::warn!(series = %series, error = %e, "Failed to remove expired grant");
      }
      return Err(AuthError::Rejected(Reject::Expired));
    }

    let presented = hash_sha256(token);
    if !constant_time_compare(&presented, &record.token) {
      return Err(self.revoke_stolen(series, &record.principal).await);
    }

    let new_token = generate_secret();
    let rotated = match self
      .tokens
      .compare_and_rotate(series, &presented, &hash_sha256(&new_token), Utc::now())
      .await
    {
      Ok(rotated) => rotated,
      // Another request rotated this token first.
      Err(TokenStoreError::TokenMismatch) => {
        return Err(self.revoke_stolen(series, &record.principal).await)
      }
      Err(TokenStoreError::UnknownSeries) => {
        return Err(AuthError::Rejected(Reject::UnknownSeries))
      }
      Err(e) => return Err(self.store_failure(series, e)),
    };

    let principal = match self.principals.load_principal(&rotated.principal).await {
      Ok(Some(principal)) => principal,
      Ok(None) => {
        if let Err(e) = self.tokens.remove_series(series).await {
          tracing::warn!(series = %series, error = %e, "Failed to remove orphaned grant");
        }
        return Err(AuthError::Rejected(Reject::PrincipalGone));
      }
      Err(e) => {
        tracing::warn!(principal = %rotated.principal, error = %e, "Principal reload failed");
        return Err(AuthError::Rejected(Reject::StoreUnavailable));
      }
    };

    let session = self.register(principal, AuthMode::Persistent, Some(series.to_string()));
    tracing::info!(
      principal = %session.principal.username,
      session = %session.id,
      "Remember-me login"
    );

    Ok(SessionGrant {
      session,
      remember_me: Some(RememberMeCookie {
        series: series.to_string(),
        token: new_token,
      }),
    })
  }

  /// The live session with `id`, if any.
  pub fn validate_session(&self, id: Uuid) -> Option<Session> {
    self.registry.read().by_id.get(&id).cloned()
  }

  pub fn state_of(&self, id: Uuid) -> SessionState {
    match self.registry.read().by_id.get(&id) {
      Some(session) => SessionState::Authenticated(session.mode),
      None => SessionState::Anonymous,
    }
  }

  pub fn active_sessions(&self) -> usize {
    self.registry.read().by_id.len()
  }

  /// End a session and revoke its remember-me series. Returns whether the
  /// session was live.
  pub async fn logout(&self, id: Uuid) -> Result<bool, AuthError> {
    let removed = {
      let mut registry = self.registry.write();
      let removed = registry.by_id.remove(&id);
      if let Some(session) = &removed {
        if registry.by_principal.get(&session.principal.username) == Some(&id) {
          registry.by_principal.remove(&session.principal.username);
        }
      }
      removed
    };

    match removed {
      Some(session) => {
        if let Some(series) = &session.series {
          self.tokens.remove_series(series).await?;
        }
        tracing::info!(principal = %session.principal.username, session = %id, "Logged out");
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// End the principal's session and revoke all of its grants. Returns the
  /// number of grants removed.
  pub async fn logout_everywhere(&self, username: &str) -> Result<u64, AuthError> {
    self.drop_principal_session(username);
    let revoked = self.tokens.revoke_all(username).await?;
    tracing::info!(principal = %username, revoked, "Logged out everywhere");
    Ok(revoked)
  }

  pub fn require_authority(&self, principal: &Principal, required: &str) -> Result<(), AuthError> {
    check_authority(&principal.authorities, required)?;
    Ok(())
  }

  /// Remove grants that have outlived the validity window.
  pub async fn purge_expired(&self) -> Result<u64, AuthError> {
    Ok(self.tokens.purge_expired(self.validity).await?)
  }

  fn register(&self, principal: Principal, mode: AuthMode, series: Option<String>) -> Session {
    let session = Session {
      id: Uuid::new_v4(),
      principal,
      mode,
      series,
      created_at: Utc::now(),
    };

    let mut registry = self.registry.write();
    if let Some(previous) = registry
      .by_principal
      .insert(session.principal.username.clone(), session.id)
    {
      registry.by_id.remove(&previous);
      tracing::debug!(
        principal = %session.principal.username,
        session = %previous,
        "Replaced previous session"
      );
    }
    registry.by_id.insert(session.id, session.clone());
    session
  }

  fn drop_principal_session(&self, username: &str) {
    let mut registry = self.registry.write();
    if let Some(id) = registry.by_principal.remove(username) {
      registry.by_id.remove(&id);
    }
  }

  fn is_expired(&self, last_used: DateTime<Utc>) -> bool {
    Utc::now()
      .signed_duration_since(last_used)
      .to_std()
      .map(|age| age > self.validity)
      .unwrap_or(false)
  }

  async fn revoke_stolen(&self, series: &str, principal: &str) -> AuthError {
    tracing::warn!(
      series = %series,
      principal = %principal,
      "Remember-me token reused, revoking series"
    );
    if let Err(e) = self.tokens.remove_series(series).await {
      tracing::warn!(series = %series, error = %e, "Failed to revoke series");
    }
    // Any session bound to the stolen series goes with it.
    let mut registry = self.registry.write();
    let bound: Vec<Uuid> = registry
      .by_id
      .values()
      .filter(|s| s.series.as_deref() == Some(series))
      .map(|s| s.id)
      .collect();
    for id in bound {
      if let Some(session) = registry.by_id.remove(&id) {
        if registry.by_principal.get(&session.principal.username) == Some(&id) {
          registry.by_principal.remove(&session.principal.username);
        }
      }
    }
    AuthError::Rejected(Reject::TokenTheft)
  }

  fn store_failure(&self, series: &str, error: TokenStoreError) -> AuthError {
    tracing::warn!(series = %series, error = %error, "Token store unavailable, rejecting");
    AuthError::Rejected(Reject::StoreUnavailable)
  }
}
