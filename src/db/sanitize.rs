//! SQL sanitization utilities for listing filters.
//!
//! Values always travel as bound parameters; these helpers only escape LIKE
//! metacharacters and check that a request names filters the listing knows.

use types::{FilterValue, PageRequest};

/// Maximum length for string values in filters
pub const MAX_STRING_VALUE_LENGTH: usize = 1024;

/// Maximum row offset a listing will scan to
pub const MAX_OFFSET: u64 = 1_000_000;

/// Escape `%`, `_` and `\` for use in a `LIKE ... ESCAPE '\'` pattern and wrap
/// the result for a contains match.
pub fn escape_like(s: &str) -> Result<String, SqlSanitizeError> {
  if s.len() > MAX_STRING_VALUE_LENGTH {
    return Err(SqlSanitizeError::StringTooLong(s.len()));
  }

  let mut escaped = String::with_capacity(s.len() + 4);
  escaped.push('%');
  for c in s.chars() {
    match c {
      '%' | '_' | '\\' => {
        escaped.push('\\');
        escaped.push(c);
      }
      '\0' => return Err(SqlSanitizeError::NullByteInString),
      _ => escaped.push(c),
    }
  }
  escaped.push('%');

  Ok(escaped)
}

/// Reject filters not in `allowed`.
pub fn validate_filters(request: &PageRequest, allowed: &[&str]) -> Result<(), SqlSanitizeError> {
  for name in request.filters().keys() {
    if !allowed.contains(&name.as_str()) {
      return Err(SqlSanitizeError::UnknownFilter(name.clone()));
    }
  }
  Ok(())
}

/// Validates that a row offset is within acceptable bounds.
pub fn validate_offset(offset: u64) -> Result<(), SqlSanitizeError> {
  if offset > MAX_OFFSET {
    return Err(SqlSanitizeError::OffsetTooLarge(offset, MAX_OFFSET));
  }
  Ok(())
}

/// Trimmed text value of filter `name`.
pub fn text_filter(request: &PageRequest, name: &str) -> Result<Option<String>, SqlSanitizeError> {
  match request.get(name) {
    None => Ok(None),
    Some(FilterValue::Text(s)) => {
      if s.contains('\0') {
        return Err(SqlSanitizeError::NullByteInString);
      }
      Ok(Some(s.trim().to_string()))
    }
    Some(_) => Err(SqlSanitizeError::FilterType(name.to_string(), "text")),
  }
}

pub fn number_filter(request: &PageRequest, name: &str) -> Result<Option<f64>, SqlSanitizeError> {
  match request.get(name) {
    None => Ok(None),
    Some(value) => value
      .as_f64()
      .map(Some)
      .ok_or_else(|| SqlSanitizeError::FilterType(name.to_string(), "number")),
  }
}

pub fn integer_filter(request: &PageRequest, name: &str) -> Result<Option<i64>, SqlSanitizeError> {
  match request.get(name) {
    None => Ok(None),
    Some(value) => value
      .as_i64()
      .map(Some)
      .ok_or_else(|| SqlSanitizeError::FilterType(name.to_string(), "integer")),
  }
}

/// SQL sanitization errors
#[derive(Debug, Clone, PartialEq)]
pub enum SqlSanitizeError {
  UnknownFilter(String),
  FilterType(String, &'static str),
  StringTooLong(usize),
  NullByteInString,
  OffsetTooLarge(u64, u64),
}

impl std::fmt::Display for SqlSanitizeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::UnknownFilter(name) => write!(f, "Unknown filter: {}", name),
      Self::FilterType(name, expected) => {
        write!(f, "Filter '{}' must be a {} value", name, expected)
      }
      Self::StringTooLong(len) => {
        write!(f, "String too long: {} > {}", len, MAX_STRING_VALUE_LENGTH)
      }
      Self::NullByteInString => write!(f, "Null bytes not allowed in strings"),
      Self::OffsetTooLarge(got, max) => write!(f, "Offset {} exceeds maximum {}", got, max),
    }
  }
}

impl std::error::Error for SqlSanitizeError {}
