//! Per-key query state.

use tokio::time::{Duration, Instant};

use super::data::CacheData;
use crate::error::ErrorKind;

/// Whether a request for this key is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
  #[default]
  Idle,
  Fetching,
}

/// Outcome status of the last settled fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// No data has ever been received
  #[default]
  Pending,
  Success,
  Error,
}

/// Error surfaced to consumers of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
  pub kind: ErrorKind,
  pub message: String,
}

/// The cached state of one query key.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
  pub data: Option<CacheData>,
  pub error: Option<ErrorInfo>,
  pub fetch_status: FetchStatus,
  pub status: QueryStatus,
  /// When data was last written by a fetch
  pub data_updated_at: Option<Instant>,
  /// Set when a write elsewhere made this entry stale and it had no
  /// subscribers to refetch it eagerly
  pub invalidated: bool,
}

impl QueryState {
  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }

  /// Loading means fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.is_fetching() && self.status == QueryStatus::Pending
  }

  /// Age of the data, `None` if it was never fetched.
  pub fn age(&self, now: Instant) -> Option<Duration> {
    self.data_updated_at.map(|t| now.saturating_duration_since(t))
  }

  /// Check if data is older than `stale_time`, or missing, or invalidated.
  pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
    if self.invalidated {
      return true;
    }
    match self.age(now) {
      Some(age) => age > stale_time,
      None => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_staleness() {
    let mut state = QueryState::default();
    let now = Instant::now();
    assert!(state.is_stale(Duration::from_secs(20), now));

    state.data_updated_at = Some(now);
    assert!(!state.is_stale(Duration::from_secs(20), now));

    tokio::time::advance(Duration::from_secs(21)).await;
    assert!(state.is_stale(Duration::from_secs(20), Instant::now()));

    state.data_updated_at = Some(Instant::now());
    state.invalidated = true;
    assert!(state.is_stale(Duration::from_secs(20), Instant::now()));
  }

  #[test]
  fn test_loading_only_without_data() {
    let mut state = QueryState {
      fetch_status: FetchStatus::Fetching,
      ..Default::default()
    };
    assert!(state.is_loading());
    state.status = QueryStatus::Success;
    assert!(!state.is_loading());
    assert!(state.is_fetching());
  }
}
