//! Shapes of cached data.

use serde::{Deserialize, Serialize};

use super::traits::{record_id, Entity, Record};

/// Pagination summary returned alongside list payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub total_pages: u32,
}

/// One page of a paginated list.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub items: Vec<Record>,
  pub pagination: Pagination,
}

/// Data held by one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheData {
  /// Full collection or a derived filtered list
  Collection(Vec<Record>),
  /// One page of a paginated list
  Page(Page),
  /// A single entity
  Detail(Record),
}

impl CacheData {
  /// All records held, regardless of shape.
  pub fn records(&self) -> &[Record] {
    match self {
      Self::Collection(items) => items,
      Self::Page(page) => &page.items,
      Self::Detail(record) => std::slice::from_ref(record),
    }
  }

  pub fn records_mut(&mut self) -> &mut [Record] {
    match self {
      Self::Collection(items) => items,
      Self::Page(page) => &mut page.items,
      Self::Detail(record) => std::slice::from_mut(record),
    }
  }

  /// Find a record by entity id.
  pub fn find(&self, id: &str) -> Option<&Record> {
    self
      .records()
      .iter()
      .find(|r| record_id(r).as_deref() == Some(id))
  }

  pub fn len(&self) -> usize {
    self.records().len()
  }

  pub fn is_empty(&self) -> bool {
    self.records().is_empty()
  }

  pub fn pagination(&self) -> Option<&Pagination> {
    match self {
      Self::Page(page) => Some(&page.pagination),
      _ => None,
    }
  }

  /// Deserialize every record as `T`, skipping records that don't fit.
  pub fn typed<T: Entity>(&self) -> Vec<T> {
    self
      .records()
      .iter()
      .filter_map(|r| match T::from_record(r) {
        Ok(entity) => Some(entity),
        Err(e) => {
          tracing::debug!(resource = T::resource(), error = %e, "skipping record that does not deserialize");
          None
        }
      })
      .collect()
  }
}
