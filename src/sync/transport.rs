//! Boundary to the backend.

use futures::future::BoxFuture;

use crate::cache::{CacheData, QueryKey, Record};
use crate::error::FetchError;

/// A write against one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Create(Record),
  Update { id: String, patch: Record },
  Delete { id: String },
}

/// Network access used by the engine.
///
/// Implementations map HTTP statuses onto [`FetchError`]; the engine never
/// sees status codes.
pub trait Transport: Send + Sync + 'static {
  /// Read the data for one query key, shaped according to the key.
  fn fetch<'a>(&'a self, key: &'a QueryKey) -> BoxFuture<'a, Result<CacheData, FetchError>>;

  /// Perform a write. Returns the mutated entity when the backend sends one.
  fn mutate<'a>(
    &'a self,
    resource: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<Option<Record>, FetchError>>;
}
