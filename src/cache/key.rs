//! Structured identifiers for cached views of a resource.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// A primitive query parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
  Int(i64),
  Str(String),
  Bool(bool),
}

impl ParamValue {
  /// Whether a JSON field value equals this parameter.
  ///
  /// Used by filtered views to decide whether a record belongs to them.
  pub fn matches_json(&self, value: &serde_json::Value) -> bool {
    match (self, value) {
      (Self::Int(i), serde_json::Value::Number(n)) => n.as_i64() == Some(*i),
      (Self::Int(i), serde_json::Value::String(s)) => s.parse::<i64>().ok() == Some(*i),
      (Self::Str(s), serde_json::Value::String(v)) => s == v,
      (Self::Str(s), serde_json::Value::Number(n)) => *s == n.to_string(),
      (Self::Bool(b), serde_json::Value::Bool(v)) => b == v,
      _ => false,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Self::Int(i) => Some(*i),
      Self::Str(s) => s.parse().ok(),
      Self::Bool(_) => None,
    }
  }
}

impl fmt::Display for ParamValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(i) => write!(f, "{}", i),
      Self::Str(s) => write!(f, "{}", s),
      Self::Bool(b) => write!(f, "{}", b),
    }
  }
}

impl From<i64> for ParamValue {
  fn from(v: i64) -> Self {
    Self::Int(v)
  }
}

impl From<u32> for ParamValue {
  fn from(v: u32) -> Self {
    Self::Int(i64::from(v))
  }
}

impl From<bool> for ParamValue {
  fn from(v: bool) -> Self {
    Self::Bool(v)
  }
}

impl From<&str> for ParamValue {
  fn from(v: &str) -> Self {
    Self::Str(v.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(v: String) -> Self {
    Self::Str(v)
  }
}

/// Which cache shape a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
  /// The canonical full collection of a resource (no parameters)
  Collection,
  /// One page of a paginated list
  Page,
  /// A single entity by id
  Detail,
  /// Any other parameterized list, e.g. "appointments with status=pending"
  Filtered,
}

/// Parameter names with a structural meaning rather than a filter meaning.
pub const PARAM_ID: &str = "id";
pub const PARAM_PAGE: &str = "page";
pub const PARAM_LIMIT: &str = "limit";

/// Identifier for one cached, parameterized view of a resource.
///
/// Two keys are equal iff the resource and every parameter match.
/// Keys are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  resource: String,
  params: BTreeMap<String, ParamValue>,
}

impl QueryKey {
  /// Key for the full collection of a resource.
  pub fn collection(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      params: BTreeMap::new(),
    }
  }

  /// Key for a single page of a resource list.
  pub fn page(resource: impl Into<String>, page: u32, limit: u32) -> Self {
    Self::collection(resource)
      .with(PARAM_PAGE, page)
      .with(PARAM_LIMIT, limit)
  }

  /// Key for a single entity.
  pub fn detail(resource: impl Into<String>, id: impl Into<String>) -> Self {
    Self::collection(resource).with(PARAM_ID, id.into())
  }

  /// Builder-style parameter insertion, consuming the key.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn param(&self, name: &str) -> Option<&ParamValue> {
    self.params.get(name)
  }

  pub fn params(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self.params.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn shape(&self) -> KeyShape {
    if self.params.contains_key(PARAM_ID) {
      KeyShape::Detail
    } else if self.params.contains_key(PARAM_PAGE) {
      KeyShape::Page
    } else if self.params.is_empty() {
      KeyShape::Collection
    } else {
      KeyShape::Filtered
    }
  }

  /// The entity id of a detail key.
  pub fn detail_id(&self) -> Option<String> {
    match self.params.get(PARAM_ID)? {
      ParamValue::Str(s) => Some(s.clone()),
      other => Some(other.to_string()),
    }
  }

  /// The page number of a page key.
  pub fn page_number(&self) -> Option<i64> {
    self.params.get(PARAM_PAGE).and_then(ParamValue::as_int)
  }

  pub fn page_limit(&self) -> Option<i64> {
    self.params.get(PARAM_LIMIT).and_then(ParamValue::as_int)
  }

  /// Parameters that filter records by field equality.
  ///
  /// Structural parameters (page, limit) are not filters.
  pub fn filters(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self
      .params()
      .filter(|(name, _)| *name != PARAM_PAGE && *name != PARAM_LIMIT)
  }

  pub fn is_resource(&self, resource: &str) -> bool {
    self.resource == resource
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.resource)?;
    for (name, value) in &self.params {
      write!(f, " {}={}", name, value)?;
    }
    Ok(())
  }
}
