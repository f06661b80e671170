//! Capability checks

/// Full management of products and users
pub const ROLE_ADMIN: &str = "ROLE_ADMIN";
/// Read-only access, granted to new accounts by default
pub const ROLE_USER: &str = "ROLE_USER";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("access denied: {required} required")]
pub struct AccessDenied {
  pub required: String,
}

/// Succeeds when `required` is among `authorities`.
pub fn check_authority<S: AsRef<str>>(authorities: &[S], required: &str) -> Result<(), AccessDenied> {
  if authorities.iter().any(|a| a.as_ref() == required) {
    Ok(())
  } else {
    Err(AccessDenied {
      required: required.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_check_authority() {
    assert!(check_authority(&[ROLE_USER, ROLE_ADMIN], ROLE_ADMIN).is_ok());
    assert_eq!(
      check_authority(&[ROLE_USER.to_string()], ROLE_ADMIN).unwrap_err(),
      AccessDenied {
        required: ROLE_ADMIN.into()
      }
    );
    assert!(check_authority::<&str>(&[], ROLE_USER).is_err());
  }

  #[test]
  fn test_match_is_exact() {
    assert!(check_authority(&["role_admin"], ROLE_ADMIN).is_err());
    assert!(check_authority(&["ROLE_ADMINISTRATOR"], ROLE_ADMIN).is_err());
  }
}
