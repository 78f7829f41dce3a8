//! Consumer-facing subscription to one query key.

use tokio::sync::watch;

use crate::cache::{CacheData, Entity, ErrorInfo, QueryKey, QueryState, Subscription};

use super::engine::SyncEngine;
use super::layer::FetchOutcome;
use super::scheduler::SchedulerState;

/// A screen's view of one query.
///
/// While at least one binding for a key is alive, that key is polled.
/// Dropping the last binding tears its scheduler down and leaves the cache
/// entry to be garbage-collected.
pub struct QueryBinding {
  key: QueryKey,
  engine: SyncEngine,
  /// Engine generation this binding was counted in
  generation: u64,
  changes: watch::Receiver<u64>,
  _subscription: Subscription,
}

impl QueryBinding {
  pub(super) fn new(
    key: QueryKey,
    engine: SyncEngine,
    generation: u64,
    changes: watch::Receiver<u64>,
    subscription: Subscription,
  ) -> Self {
    Self {
      key,
      engine,
      generation,
      changes,
      _subscription: subscription,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Snapshot of the current query state.
  pub fn state(&self) -> QueryState {
    self.engine.store().peek(&self.key).unwrap_or_default()
  }

  pub fn data(&self) -> Option<CacheData> {
    self.state().data
  }

  /// The data as typed entities.
  pub fn items<T: Entity>(&self) -> Vec<T> {
    self.data().map(|d| d.typed()).unwrap_or_default()
  }

  pub fn error(&self) -> Option<ErrorInfo> {
    self.state().error
  }

  /// True while the first fetch is in flight and there is nothing to show.
  pub fn is_loading(&self) -> bool {
    self.state().is_loading()
  }

  pub fn is_fetching(&self) -> bool {
    self.state().is_fetching()
  }

  /// Fetch now. A no-op if a request for this key is already in flight,
  /// the backend is rate limited, or the key is forbidden.
  pub async fn refetch(&self) -> FetchOutcome {
    self.engine.layer().fetch(&self.key).await
  }

  pub fn scheduler_state(&self) -> Option<SchedulerState> {
    self.engine.scheduler_state(&self.key)
  }

  /// Wait for the next change to this key's state.
  ///
  /// Returns `false` once the engine has dropped the entry for good.
  pub async fn changed(&mut self) -> bool {
    self.changes.changed().await.is_ok()
  }
}

impl Drop for QueryBinding {
  fn drop(&mut self) {
    self.engine.release(&self.key, self.generation);
  }
}

impl std::fmt::Debug for QueryBinding {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryBinding")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}
