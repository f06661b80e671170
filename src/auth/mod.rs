//! Authentication and authorization
//!
//! - [`check_authority`]: pure capability check
//! - [`PersistentTokenStore`]: durable remember-me grants
//! - [`SessionAuthority`]: sessions, remember-me issuance and rotation

mod authority;
mod credentials;
mod session;
mod token_store;

pub use authority::{check_authority, AccessDenied, ROLE_ADMIN, ROLE_USER};
pub use credentials::DbCredentialVerifier;
pub use session::{
  AuthError, AuthMode, CredentialVerifier, PrincipalLoader, Reject, RememberMeCookie, Session,
  SessionAuthority, SessionGrant, SessionState,
};
pub use token_store::{PersistentTokenStore, TokenStoreError};
