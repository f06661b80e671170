//! Credential checks against the user registry

use async_trait::async_trait;
use std::sync::Arc;

use types::{Principal, User};

use super::session::{CredentialVerifier, PrincipalLoader};
use crate::db::DatabaseBackend;
use crate::security::verify_password;

/// Verifies Argon2 password hashes stored in `users.password` and loads
/// authorities from the user's roles.
pub struct DbCredentialVerifier {
  backend: Arc<dyn DatabaseBackend>,
}

impl DbCredentialVerifier {
  pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
    Self { backend }
  }

  async fn principal_for(&self, user: &User) -> Result<Principal, anyhow::Error> {
    Ok(Principal {
      user_id: user.id,
      username: user.username.clone(),
      authorities: self.backend.user_authorities(user.id).await?,
    })
  }
}

#[async_trait]
impl CredentialVerifier for DbCredentialVerifier {
  async fn verify_credentials(
    &self,
    identity: &str,
    secret: &str,
  ) -> Result<Option<Principal>, anyhow::Error> {
    let Some((user, hash)) = self.backend.get_user_credentials(identity).await? else {
      return Ok(None);
    };
    if !user.is_active() {
      tracing::debug!(username = %user.username, "Login refused for disabled account");
      return Ok(None);
    }

    // Argon2 verification blocks.
    let secret = secret.to_string();
    let valid = tokio::task::spawn_blocking(move || verify_password(&secret, &hash)).await?;
    if !valid {
      return Ok(None);
    }

    self.backend.touch_last_login(user.id).await?;
    Ok(Some(self.principal_for(&user).await?))
  }
}

#[async_trait]
impl PrincipalLoader for DbCredentialVerifier {
  async fn load_principal(&self, username: &str) -> Result<Option<Principal>, anyhow::Error> {
    match self.backend.get_user_by_username(username).await? {
      Some(user) if user.is_active() => Ok(Some(self.principal_for(&user).await?)),
      _ => Ok(None),
    }
  }
}
