//! Cache key construction for paginated queries.
//!
//! A key has the shape `<namespace>:page=<p>:size=<s>:<field>=<token>...`.
//! Every value token starts with a one-letter type tag and text is
//! percent-encoded, so no value can contain a separator or collide with the
//! placeholder used for absent filters.

use types::{FilterValue, PageRequest};

/// Token emitted for a declared filter that is absent or empty.
pub const NULL_TOKEN: &str = "-";

/// Builds cache keys for one query family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeyCodec {
  namespace: String,
  fields: Vec<String>,
}

impl QueryKeyCodec {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      fields: Vec::new(),
    }
  }

  /// Declare the filter fields of this query family. Declared fields are
  /// always written, in declaration order, with [`NULL_TOKEN`] when unset.
  pub fn with_fields<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields = fields.into_iter().map(Into::into).collect();
    self
  }

  /// Same fields under another namespace.
  pub fn renamed(&self, namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      fields: self.fields.clone(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  /// Prefix shared by every key of this namespace.
  pub fn prefix(&self) -> String {
    namespace_prefix(&self.namespace)
  }

  pub fn encode(&self, request: &PageRequest) -> String {
    encode_with_fields(&self.namespace, &self.fields, request)
  }
}

/// Encode `request` under `namespace` with no declared fields.
pub fn encode(namespace: &str, request: &PageRequest) -> String {
  encode_with_fields(namespace, &[], request)
}

pub fn namespace_prefix(namespace: &str) -> String {
  format!("{}:", namespace)
}

fn encode_with_fields(namespace: &str, fields: &[String], request: &PageRequest) -> String {
  let mut key = String::with_capacity(namespace.len() + 32 + fields.len() * 16);
  key.push_str(namespace);
  key.push_str(":page=");
  key.push_str(&request.page().to_string());
  key.push_str(":size=");
  key.push_str(&request.size().to_string());

  for field in fields {
    push_field(&mut key, field, request.get(field));
  }

  // BTreeMap iteration is sorted, which keeps undeclared filters canonical.
  for (name, value) in request.filters() {
    if fields.iter().any(|f| f == name) {
      continue;
    }
    push_field(&mut key, name, Some(value));
  }

  key
}

fn push_field(key: &mut String, name: &str, value: Option<&FilterValue>) {
  key.push(':');
  key.push_str(name);
  key.push('=');
  match value {
    Some(v) if !v.is_empty() => key.push_str(&encode_value(v)),
    _ => key.push_str(NULL_TOKEN),
  }
}

fn encode_value(value: &FilterValue) -> String {
  match value {
    FilterValue::Text(s) => format!("s{}", urlencoding::encode(s)),
    FilterValue::Integer(i) => format!("i{}", i),
    FilterValue::Number(n) => format!("n{}", format_number(*n)),
    FilterValue::Range { min, max } => format!(
      "r{}~{}",
      min.map(format_number).unwrap_or_else(|| "_".into()),
      max.map(format_number).unwrap_or_else(|| "_".into()),
    ),
  }
}

/// Shortest round-trip decimal form. Locale independent, and equal values
/// (`10.0`, `10.00`, `-0.0` vs `0.0`) produce the same text.
pub fn format_number(n: f64) -> String {
  if n == 0.0 {
    "0".to_string()
  } else {
    format!("{}", n)
  }
}
