//! Fetch execution: single-flight requests written through to the cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheData, CacheStore, ErrorInfo, FetchStatus, QueryKey, QueryStatus};
use crate::error::{ErrorKind, FetchError};

use super::rate_limit::RateLimitGuard;
use super::transport::Transport;

/// What happened when a fetch was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Data written to the cache
  Success,
  /// Another request for the key is in flight; nothing was sent
  InFlight,
  /// The backend is rate limited; nothing was sent
  Suppressed,
  /// The backend answered 429
  RateLimited { retry_after: Option<Duration> },
  /// The caller lacks permission; the key is disabled for the session
  Forbidden,
  /// Any other error, stored on the query state
  Failed(ErrorKind),
  /// The engine was reset while the request was in flight; the response
  /// was dropped
  Superseded,
}

/// Issues requests through the transport and records results in the store.
///
/// This is the only place that writes fetched data. It enforces one request
/// per key at a time, feeds 429s to the shared guard, and remembers keys the
/// backend refused with 403.
#[derive(Clone)]
pub struct CacheLayer {
  store: CacheStore,
  transport: Arc<dyn Transport>,
  guard: RateLimitGuard,
  /// Cool-down recorded on the guard when a 429 carries no Retry-After
  floor: Duration,
  forbidden: Arc<Mutex<HashSet<QueryKey>>>,
  /// Bumped on reset so late responses never reach the new session
  session: Arc<AtomicU64>,
}

impl CacheLayer {
  pub fn new(
    store: CacheStore,
    transport: Arc<dyn Transport>,
    guard: RateLimitGuard,
    floor: Duration,
  ) -> Self {
    Self {
      store,
      transport,
      guard,
      floor,
      forbidden: Arc::new(Mutex::new(HashSet::new())),
      session: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn is_forbidden(&self, key: &QueryKey) -> bool {
    self
      .forbidden
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains(key)
  }

  /// Start a new session: forget forbidden keys and orphan every request
  /// still in flight.
  pub(crate) fn new_session(&self) {
    self.session.fetch_add(1, Ordering::SeqCst);
    self.forbidden.lock().unwrap_or_else(|e| e.into_inner()).clear();
  }

  fn session(&self) -> u64 {
    self.session.load(Ordering::SeqCst)
  }

  /// Fetch `key` unless it is forbidden, rate limited or already in flight.
  pub async fn fetch(&self, key: &QueryKey) -> FetchOutcome {
    if self.is_forbidden(key) {
      return FetchOutcome::Forbidden;
    }
    if self.guard.is_limited() {
      debug!(key = %key, "fetch suppressed while rate limited");
      return FetchOutcome::Suppressed;
    }
    if !self.store.begin_fetch(key) {
      debug!(key = %key, "fetch already in flight");
      return FetchOutcome::InFlight;
    }

    let mut session = self.session();
    loop {
      debug!(key = %key, "fetching");
      let result = self.transport.fetch(key).await;
      if self.session() == session {
        return self.settle(key, result);
      }

      // The key is still marked in flight, so a new subscriber is waiting
      // on this request. Send it again for the current session.
      debug!(key = %key, "dropping response from before reset");
      let abandoned =
        self.store.subscriber_count(key) == 0 || self.guard.is_limited() || self.is_forbidden(key);
      if abandoned {
        self.store.update(key, |state| state.fetch_status = FetchStatus::Idle);
        return FetchOutcome::Superseded;
      }
      session = self.session();
    }
  }

  fn settle(&self, key: &QueryKey, result: Result<CacheData, FetchError>) -> FetchOutcome {
    match result {
      Ok(data) => {
        let count = data.len();
        self.store.update(key, |state| {
          state.data = Some(data);
          state.error = None;
          state.status = QueryStatus::Success;
          state.fetch_status = FetchStatus::Idle;
          state.data_updated_at = Some(Instant::now());
          state.invalidated = false;
        });
        debug!(key = %key, count, "fetch succeeded");
        FetchOutcome::Success
      }
      Err(FetchError::RateLimited { retry_after }) => {
        self.guard.set_limited(retry_after.unwrap_or(self.floor));
        // Only surfaced when there is nothing else to show.
        self.store.update(key, |state| {
          state.fetch_status = FetchStatus::Idle;
          if state.data.is_none() {
            state.error = Some(ErrorInfo {
              kind: ErrorKind::RateLimited,
              message: "server is busy, retrying later".to_string(),
            });
            state.status = QueryStatus::Error;
          }
        });
        FetchOutcome::RateLimited { retry_after }
      }
      Err(err @ FetchError::Forbidden(_)) => {
        warn!(key = %key, error = %err, "permission denied, disabling key");
        self
          .forbidden
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .insert(key.clone());
        self.record_error(key, &err);
        FetchOutcome::Forbidden
      }
      Err(err) => {
        warn!(key = %key, error = %err, "fetch failed");
        self.record_error(key, &err);
        FetchOutcome::Failed(err.kind())
      }
    }
  }

  /// Store an error while keeping whatever data is present.
  fn record_error(&self, key: &QueryKey, err: &FetchError) {
    let info = ErrorInfo {
      kind: err.kind(),
      message: err.to_string(),
    };
    self.store.update(key, |state| {
      state.fetch_status = FetchStatus::Idle;
      state.error = Some(info);
      state.status = QueryStatus::Error;
    });
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  pub fn guard(&self) -> &RateLimitGuard {
    &self.guard
  }

  pub fn floor(&self) -> Duration {
    self.floor
  }
}
