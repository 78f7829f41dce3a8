//! Polling, rate limiting and cache fan-out on top of [`crate::cache`].

pub mod backoff;
pub mod binding;
pub mod engine;
pub mod layer;
#[cfg(test)]
pub(crate) mod mock;
pub mod policy;
pub mod projector;
pub mod rate_limit;
pub mod scheduler;
pub mod transport;
pub mod visibility;

pub use binding::QueryBinding;
pub use engine::SyncEngine;
pub use layer::{CacheLayer, FetchOutcome};
pub use policy::{PollPolicy, SyncSettings};
pub use projector::CacheProjector;
pub use rate_limit::RateLimitGuard;
pub use scheduler::{PollingScheduler, SchedulerState};
pub use transport::{Mutation, Transport};
pub use visibility::{Visibility, VisibilityController};

use std::sync::{Arc, RwLock};
use tracing::info;

static ENGINE: RwLock<Option<SyncEngine>> = RwLock::new(None);

/// Install the process-wide engine, replacing any previous one.
pub fn init(settings: SyncSettings, transport: Arc<dyn Transport>) -> SyncEngine {
  let engine = SyncEngine::new(settings, transport);
  let previous = ENGINE
    .write()
    .unwrap_or_else(|e| e.into_inner())
    .replace(engine.clone());
  if let Some(previous) = previous {
    info!("replacing existing sync engine");
    previous.reset();
  }
  engine
}

/// The process-wide engine, if [`init`] has run.
pub fn global() -> Option<SyncEngine> {
  ENGINE.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Reset the process-wide engine, e.g. on logout. The engine stays
/// installed and can be bound again.
pub fn reset() {
  if let Some(engine) = global() {
    engine.reset();
  }
}
