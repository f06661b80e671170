use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PageRequestError {
  #[error("page index must be at least 1, got {0}")]
  InvalidPage(u32),
  #[error("page size must be between 1 and {max}, got {0}", max = MAX_PAGE_SIZE)]
  InvalidSize(u32),
  #[error("invalid filter name: {0:?}")]
  InvalidFilterName(String),
  #[error("filter {0} must be a finite number")]
  NonFiniteNumber(String),
}

/// A scalar filter value attached to a page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FilterValue {
  Text(String),
  Integer(i64),
  Number(f64),
  Range { min: Option<f64>, max: Option<f64> },
}

impl FilterValue {
  /// Whether the value carries no constraint. Blank text and open ranges
  /// are treated exactly like an absent filter.
  pub fn is_empty(&self) -> bool {
    match self {
      FilterValue::Text(s) => s.trim().is_empty(),
      FilterValue::Range { min, max } => min.is_none() && max.is_none(),
      FilterValue::Integer(_) | FilterValue::Number(_) => false,
    }
  }

  fn is_finite(&self) -> bool {
    match self {
      FilterValue::Number(n) => n.is_finite(),
      FilterValue::Range { min, max } => {
        min.map(f64::is_finite).unwrap_or(true) && max.map(f64::is_finite).unwrap_or(true)
      }
      FilterValue::Text(_) | FilterValue::Integer(_) => true,
    }
  }

  /// Canonical form of the value: text is trimmed and integral numbers
  /// become integers, so requests that select the same rows compare equal.
  fn canonical(self) -> Self {
    // Largest magnitude at which every integer is exactly representable.
    const EXACT_INT: f64 = 9_007_199_254_740_992.0;
    match self {
      FilterValue::Text(s) if s.trim().len() != s.len() => FilterValue::Text(s.trim().to_string()),
      FilterValue::Number(n) if n.fract() == 0.0 && n.abs() <= EXACT_INT => {
        FilterValue::Integer(n as i64)
      }
      other => other,
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      FilterValue::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      FilterValue::Integer(i) => Some(*i),
      _ => None,
    }
  }

  /// Numeric view; integers widen to `f64`.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      FilterValue::Number(n) => Some(*n),
      FilterValue::Integer(i) => Some(*i as f64),
      _ => None,
    }
  }
}

impl From<&str> for FilterValue {
  fn from(s: &str) -> Self {
    FilterValue::Text(s.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(s: String) -> Self {
    FilterValue::Text(s)
  }
}

impl From<i64> for FilterValue {
  fn from(i: i64) -> Self {
    FilterValue::Integer(i)
  }
}

impl From<i32> for FilterValue {
  fn from(i: i32) -> Self {
    FilterValue::Integer(i as i64)
  }
}

impl From<f64> for FilterValue {
  fn from(n: f64) -> Self {
    FilterValue::Number(n)
  }
}

/// Paging parameters plus named optional filters.
///
/// Filters live in a `BTreeMap`, so two requests built with the same filters
/// in a different order compare (and encode) identically. Empty filter values
/// are dropped on insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPageRequest")]
pub struct PageRequest {
  page: u32,
  size: u32,
  filters: BTreeMap<String, FilterValue>,
}

impl PageRequest {
  pub fn new(page: u32, size: u32) -> Result<Self, PageRequestError> {
    if page < 1 {
      return Err(PageRequestError::InvalidPage(page));
    }
    if size < 1 || size > MAX_PAGE_SIZE {
      return Err(PageRequestError::InvalidSize(size));
    }
    Ok(Self {
      page,
      size,
      filters: BTreeMap::new(),
    })
  }

  pub fn first(size: u32) -> Result<Self, PageRequestError> {
    Self::new(1, size)
  }

  /// Attach a filter. Blank values remove any previous value for `name`.
  pub fn filter(
    mut self,
    name: impl Into<String>,
    value: impl Into<FilterValue>,
  ) -> Result<Self, PageRequestError> {
    let name = name.into();
    validate_filter_name(&name)?;
    let value = value.into();
    if !value.is_finite() {
      return Err(PageRequestError::NonFiniteNumber(name));
    }
    if value.is_empty() {
      self.filters.remove(&name);
    } else {
      self.filters.insert(name, value.canonical());
    }
    Ok(self)
  }

  pub fn filter_opt<V: Into<FilterValue>>(
    self,
    name: impl Into<String>,
    value: Option<V>,
  ) -> Result<Self, PageRequestError> {
    match value {
      Some(v) => self.filter(name, v),
      None => {
        let name = name.into();
        validate_filter_name(&name)?;
        Ok(self)
      }
    }
  }

  pub fn page(&self) -> u32 {
    self.page
  }

  pub fn size(&self) -> u32 {
    self.size
  }

  pub fn filters(&self) -> &BTreeMap<String, FilterValue> {
    &self.filters
  }

  pub fn get(&self, name: &str) -> Option<&FilterValue> {
    self.filters.get(name)
  }

  /// Row offset of the first record on this page.
  pub fn offset(&self) -> u64 {
    (self.page as u64 - 1) * self.size as u64
  }
}

fn validate_filter_name(name: &str) -> Result<(), PageRequestError> {
  let valid = !name.is_empty()
    && name.len() <= 64
    && name
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(PageRequestError::InvalidFilterName(name.to_string()))
  }
}

#[derive(Deserialize)]
struct RawPageRequest {
  #[serde(default = "default_page")]
  page: u32,
  #[serde(default = "default_size")]
  size: u32,
  #[serde(default)]
  filters: BTreeMap<String, Option<FilterValue>>,
}

fn default_page() -> u32 {
  1
}

fn default_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

impl TryFrom<RawPageRequest> for PageRequest {
  type Error = PageRequestError;

  fn try_from(raw: RawPageRequest) -> Result<Self, Self::Error> {
    let mut request = PageRequest::new(raw.page, raw.size)?;
    for (name, value) in raw.filters {
      request = request.filter_opt(name, value)?;
    }
    Ok(request)
  }
}

/// One page of records together with the paging totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
  pub records: Vec<T>,
  pub total: u64,
  pub pages: u64,
  pub page: u32,
  pub size: u32,
}

impl<T> PageResult<T> {
  pub fn new(records: Vec<T>, total: u64, page: u32, size: u32) -> Self {
    let pages = if size == 0 {
      0
    } else {
      total.div_ceil(size as u64)
    };
    Self {
      records,
      total,
      pages,
      page,
      size,
    }
  }

  pub fn empty(page: u32, size: u32) -> Self {
    Self::new(Vec::new(), 0, page, size)
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}
