mod common;

use catalogd::auth::{
  AuthError, AuthMode, DbCredentialVerifier, PersistentTokenStore, Reject, RememberMeCookie,
  SessionAuthority, SessionState, TokenStoreError, ROLE_ADMIN, ROLE_USER,
};
use catalogd::db::{DatabaseBackend, SqliteBackend};
use catalogd::security::{hash_password, hash_sha256};
use catalogd::types::{UserDraft, STATUS_DISABLED};
use chrono::{Duration as ChronoDuration, Utc};
use common::FlakyBackend;
use std::sync::Arc;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(86400);

struct Fixture {
  backend: Arc<dyn DatabaseBackend>,
  tokens: Arc<PersistentTokenStore>,
  sessions: Arc<SessionAuthority>,
}

async fn fixture() -> Fixture {
  let backend: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::in_memory().await.unwrap());
  backend.init_schema().await.unwrap();
  add_user(&backend, "alice", "wonderland", &[ROLE_ADMIN]).await;
  add_user(&backend, "bob", "builder", &[ROLE_USER]).await;

  let tokens = Arc::new(PersistentTokenStore::new(backend.clone(), Duration::from_secs(2)));
  let verifier = Arc::new(DbCredentialVerifier::new(backend.clone()));
  let sessions = Arc::new(SessionAuthority::new(
    tokens.clone(),
    verifier.clone(),
    verifier,
    DAY,
  ));
  Fixture {
    backend,
    tokens,
    sessions,
  }
}

/// Sessions over a backend whose grant calls can fail or hang, with a short
/// token store timeout.
async fn flaky_fixture() -> (Arc<FlakyBackend>, Arc<SessionAuthority>) {
  let flaky = Arc::new(FlakyBackend::new().await);
  let backend: Arc<dyn DatabaseBackend> = flaky.clone();
  add_user(&backend, "alice", "wonderland", &[ROLE_ADMIN]).await;

  let tokens = Arc::new(PersistentTokenStore::new(backend.clone(), Duration::from_millis(100)));
  let verifier = Arc::new(DbCredentialVerifier::new(backend));
  let sessions = Arc::new(SessionAuthority::new(tokens, verifier.clone(), verifier, DAY));
  (flaky, sessions)
}

async fn add_user(backend: &Arc<dyn DatabaseBackend>, username: &str, password: &str, roles: &[&str]) {
  let draft = UserDraft {
    username: username.into(),
    roles: Some(roles.iter().map(|r| r.to_string()).collect()),
    ..Default::default()
  };
  backend
    .insert_user(&draft, &hash_password(password).unwrap())
    .await
    .unwrap();
}

#[tokio::test]
async fn test_login_without_remember_me() {
  let f = fixture().await;
  let grant = f.sessions.login("alice", "wonderland", false).await.unwrap();

  assert!(grant.remember_me.is_none());
  assert_eq!(grant.session.mode, AuthMode::Interactive);
  assert_eq!(grant.session.principal.authorities, vec![ROLE_ADMIN.to_string()]);
  assert_eq!(
    f.sessions.state_of(grant.session.id),
    SessionState::Authenticated(AuthMode::Interactive)
  );
}

#[tokio::test]
async fn test_bad_credentials() {
  let f = fixture().await;
  let err = f.sessions.login("alice", "nope", false).await.unwrap_err();
  assert!(matches!(err, AuthError::BadCredentials));
  let err = f.sessions.login("nobody", "nope", false).await.unwrap_err();
  assert!(matches!(err, AuthError::BadCredentials));
  assert_eq!(f.sessions.active_sessions(), 0);
}

#[tokio::test]
async fn test_remember_me_token_is_stored_hashed() {
  let f = fixture().await;
  let grant = f.sessions.login("alice", "wonderland", true).await.unwrap();
  let cookie = grant.remember_me.unwrap();

  let stored = f.tokens.lookup(&cookie.series).await.unwrap().unwrap();
  assert_eq!(stored.principal, "alice");
  assert_eq!(stored.token, hash_sha256(&cookie.token));
  assert_ne!(stored.token, cookie.token);
}

#[tokio::test]
async fn test_auto_login_rotates_token() {
  let f = fixture().await;
  let first = f.sessions.login("alice", "wonderland", true).await.unwrap();
  let cookie = first.remember_me.unwrap();

  let second = f.sessions.validate_cookie(&cookie.encode()).await.unwrap();
  let rotated = second.remember_me.unwrap();
  assert_eq!(rotated.series, cookie.series);
  assert_ne!(rotated.token, cookie.token);
  assert_eq!(second.session.mode, AuthMode::Persistent);
  assert_eq!(second.session.principal.username, "alice");

  // The replacement works once more.
  f.sessions
    .validate_incoming_token(&rotated.series, &rotated.token)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_one_session_per_principal() {
  let f = fixture().await;
  let first = f.sessions.login("alice", "wonderland", false).await.unwrap();
  let second = f.sessions.login("alice", "wonderland", false).await.unwrap();
  f.sessions.login("bob", "builder", false).await.unwrap();

  assert_eq!(f.sessions.state_of(first.session.id), SessionState::Anonymous);
  assert!(f.sessions.validate_session(second.session.id).is_some());
  assert_eq!(f.sessions.active_sessions(), 2);
}

#[tokio::test]
async fn test_reused_token_revokes_series() {
  let f = fixture().await;
  let grant = f.sessions.login("alice", "wonderland", true).await.unwrap();
  let stolen = grant.remember_me.unwrap();

  // The legitimate client rotates first.
  let fresh = f
    .sessions
    .validate_incoming_token(&stolen.series, &stolen.token)
    .await
    .unwrap();

  let err = f
    .sessions
    .validate_incoming_token(&stolen.series, &stolen.token)
    .await
    .unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::TokenTheft)));
  assert!(f.tokens.lookup(&stolen.series).await.unwrap().is_none());
  assert!(f.sessions.validate_session(fresh.session.id).is_none());

  let rotated = fresh.remember_me.unwrap();
  let err = f
    .sessions
    .validate_incoming_token(&rotated.series, &rotated.token)
    .await
    .unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::UnknownSeries)));
}

#[tokio::test]
async fn test_concurrent_auto_logins_have_one_winner() {
  let f = fixture().await;
  let cookie = f
    .sessions
    .login("alice", "wonderland", true)
    .await
    .unwrap()
    .remember_me
    .unwrap();

  let a = tokio::spawn({
    let sessions = f.sessions.clone();
    let cookie = cookie.clone();
    async move { sessions.validate_incoming_token(&cookie.series, &cookie.token).await }
  });
  let b = tokio::spawn({
    let sessions = f.sessions.clone();
    let cookie = cookie.clone();
    async move { sessions.validate_incoming_token(&cookie.series, &cookie.token).await }
  });
  let results = [a.await.unwrap(), b.await.unwrap()];

  assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
  assert!(results
    .iter()
    .any(|r| matches!(r, Err(AuthError::Rejected(Reject::TokenTheft)))));
  // The loser's conflict revokes the series for everyone.
  assert!(f.tokens.lookup(&cookie.series).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_grant_is_rejected_and_removed() {
  let f = fixture().await;
  let stale = Utc::now() - ChronoDuration::days(2);
  f.tokens
    .create_token("alice", "aa11", &hash_sha256("bb22"), stale)
    .await
    .unwrap();

  let err = f.sessions.validate_cookie("aa11:bb22").await.unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::Expired)));
  assert!(f.tokens.lookup("aa11").await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_and_unknown_cookies() {
  let f = fixture().await;
  for bad in ["", "no-colon", "zz:11", ":11", "11:"] {
    let err = f.sessions.validate_cookie(bad).await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected(Reject::Malformed)), "{}", bad);
  }
  let err = f.sessions.validate_cookie("abc:def").await.unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::UnknownSeries)));
}

#[tokio::test]
async fn test_disabled_principal_cannot_auto_login() {
  let f = fixture().await;
  let cookie = f
    .sessions
    .login("bob", "builder", true)
    .await
    .unwrap()
    .remember_me
    .unwrap();

  let bob = f.backend.get_user_by_username("bob").await.unwrap().unwrap();
  let draft = UserDraft {
    username: "bob".into(),
    status: Some(STATUS_DISABLED),
    ..Default::default()
  };
  f.backend.update_user(bob.id, &draft, None).await.unwrap();

  let err = f.sessions.validate_cookie(&cookie.encode()).await.unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::PrincipalGone)));
  assert!(f.tokens.lookup(&cookie.series).await.unwrap().is_none());
}

#[tokio::test]
async fn test_logout_revokes_series() {
  let f = fixture().await;
  let grant = f.sessions.login("alice", "wonderland", true).await.unwrap();
  let cookie = grant.remember_me.unwrap();

  assert!(f.sessions.logout(grant.session.id).await.unwrap());
  assert!(!f.sessions.logout(grant.session.id).await.unwrap());
  assert!(f.tokens.lookup(&cookie.series).await.unwrap().is_none());
}

#[tokio::test]
async fn test_logout_everywhere() {
  let f = fixture().await;
  f.sessions.login("alice", "wonderland", true).await.unwrap();
  f.sessions.login("alice", "wonderland", true).await.unwrap();

  assert_eq!(f.sessions.logout_everywhere("alice").await.unwrap(), 2);
  assert_eq!(f.sessions.active_sessions(), 0);
}

#[tokio::test]
async fn test_require_authority() {
  let f = fixture().await;
  let admin = f.sessions.login("alice", "wonderland", false).await.unwrap();
  let user = f.sessions.login("bob", "builder", false).await.unwrap();

  assert!(f
    .sessions
    .require_authority(&admin.session.principal, ROLE_ADMIN)
    .is_ok());
  let err = f
    .sessions
    .require_authority(&user.session.principal, ROLE_ADMIN)
    .unwrap_err();
  assert!(matches!(err, AuthError::AccessDenied(_)));
}

#[test]
fn test_cookie_format() {
  let cookie = RememberMeCookie {
    series: "0a1b".into(),
    token: "ff00".into(),
  };
  assert_eq!(cookie.encode(), "0a1b:ff00");
  assert_eq!(RememberMeCookie::parse("0a1b:ff00"), Some(cookie));
}

#[tokio::test]
async fn test_stalled_token_store_rejects_auto_login() {
  let (flaky, sessions) = flaky_fixture().await;
  let grant = sessions.login("alice", "wonderland", true).await.unwrap();
  let cookie = grant.remember_me.unwrap().encode();
  let before = sessions.active_sessions();

  flaky.stall(true);
  let err = sessions.validate_cookie(&cookie).await.unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::StoreUnavailable)));
  assert_eq!(sessions.active_sessions(), before);
  assert!(sessions.validate_session(grant.session.id).is_some());

  // Nothing was rotated, so the same cookie works once the store recovers.
  flaky.stall(false);
  let again = sessions.validate_cookie(&cookie).await.unwrap();
  assert_eq!(again.session.principal.username, "alice");
}

#[tokio::test]
async fn test_failing_token_store_rejects_auto_login() {
  let (flaky, sessions) = flaky_fixture().await;
  let grant = sessions.login("alice", "wonderland", true).await.unwrap();
  let cookie = grant.remember_me.unwrap().encode();

  flaky.fail(true);
  let err = sessions.validate_cookie(&cookie).await.unwrap_err();
  assert!(matches!(err, AuthError::Rejected(Reject::StoreUnavailable)));
}

#[tokio::test]
async fn test_failed_grant_issue_registers_no_session() {
  let (flaky, sessions) = flaky_fixture().await;

  flaky.fail(true);
  let err = sessions.login("alice", "wonderland", true).await.unwrap_err();
  assert!(matches!(err, AuthError::TokenStore(_)));
  assert_eq!(sessions.active_sessions(), 0);

  flaky.fail(false);
  flaky.stall(true);
  let err = sessions.login("alice", "wonderland", true).await.unwrap_err();
  assert!(matches!(err, AuthError::TokenStore(TokenStoreError::Timeout(_))));
  assert_eq!(sessions.active_sessions(), 0);

  // Logins without remember-me never touch the grant store.
  let grant = sessions.login("alice", "wonderland", false).await.unwrap();
  assert_eq!(grant.session.mode, AuthMode::Interactive);
  assert_eq!(sessions.active_sessions(), 1);
}
