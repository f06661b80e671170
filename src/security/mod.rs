//! Security primitives
//!
//! - Constant-time comparison for secrets
//! - SHA-256 digests for tokens kept at rest
//! - Random secret generation
//! - Argon2id password hashing

use argon2::{
  password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
  Argon2,
};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Constant-time string comparison to prevent timing attacks.
/// Returns true if both strings are equal.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
  if a.len() != b.len() {
    return false;
  }

  let mut result: u8 = 0;
  for (x, y) in a.bytes().zip(b.bytes()) {
    result |= x ^ y;
  }
  result == 0
}

/// Hash a value using SHA-256 and return as hex string
pub fn hash_sha256(value: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(value.as_bytes());
  hex::encode(hasher.finalize())
}

/// 32 random bytes, hex encoded
pub fn generate_secret() -> String {
  let bytes: [u8; 32] = rand::thread_rng().gen();
  hex::encode(bytes)
}

/// Hash a password using Argon2id
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
  let salt = SaltString::generate(&mut OsRng);
  let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
  Ok(hash.to_string())
}

/// Verify a password against an Argon2 hash. Malformed hashes never verify.
pub fn verify_password(password: &str, hash: &str) -> bool {
  let parsed_hash = match PasswordHash::new(hash) {
    Ok(h) => h,
    Err(_) => return false,
  };
  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .is_ok()
}
