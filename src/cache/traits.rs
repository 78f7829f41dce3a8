//! Core traits and types for cached entities.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// A JSON object holding one entity as the backend returned it.
pub type Record = Map<String, Value>;

/// Trait for typed entities that live in the cache.
///
/// The cache itself stores untyped [`Record`]s so that one projector can
/// work across every resource; typed views deserialize on read.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Resource name the entity belongs to (e.g. "appointments")
  fn resource() -> &'static str;

  /// Stable identifier of this entity
  fn entity_id(&self) -> String;

  /// Convert into a cache record.
  fn to_record(&self) -> serde_json::Result<Record> {
    match serde_json::to_value(self)? {
      Value::Object(map) => Ok(map),
      other => Err(serde::de::Error::custom(format!(
        "entity did not serialize to an object: {}",
        other
      ))),
    }
  }

  /// Build from a cache record.
  fn from_record(record: &Record) -> serde_json::Result<Self> {
    serde_json::from_value(Value::Object(record.clone()))
  }
}

/// A field that may hold either a bare id or a populated object.
///
/// Backends commonly return `"client": "c1"` in one endpoint and
/// `"client": { "_id": "c1", "name": ... }` in another.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef {
  Id(String),
  Inline(Record),
}

impl EntityRef {
  /// Classify a JSON value. Returns `None` for values that cannot carry an id.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) => Some(Self::Id(s.clone())),
      Value::Number(n) => Some(Self::Id(n.to_string())),
      Value::Object(map) => Some(Self::Inline(map.clone())),
      _ => None,
    }
  }

  /// The referenced entity id, whichever form the reference takes.
  pub fn id(&self) -> Option<String> {
    match self {
      Self::Id(id) => Some(id.clone()),
      Self::Inline(record) => record_id(record),
    }
  }
}

/// Extract the id of a record from `_id` or `id`.
pub fn record_id(record: &Record) -> Option<String> {
  ["_id", "id"]
    .iter()
    .filter_map(|field| record.get(*field))
    .filter_map(EntityRef::from_value)
    .find_map(|r| r.id())
}

/// Merge `patch` fields into `record`, overwriting existing values.
pub fn apply_patch(record: &mut Record, patch: &Record) {
  for (field, value) in patch {
    record.insert(field.clone(), value.clone());
  }
}
