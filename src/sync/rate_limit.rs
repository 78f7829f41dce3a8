//! Process-wide rate-limit state.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shared record of whether the backend has signaled overload.
///
/// The backend enforces one limiter for the whole session, so a single guard
/// is shared by every scheduler. Expiry is time-based: the limit clears when
/// `now >= expires_at` and never because a caller wants to retry.
#[derive(Clone)]
pub struct RateLimitGuard {
  expires_at: Arc<watch::Sender<Option<Instant>>>,
}

impl RateLimitGuard {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(None);
    Self {
      expires_at: Arc::new(tx),
    }
  }

  /// Check the limit, clearing it if it has expired.
  pub fn is_limited(&self) -> bool {
    let now = Instant::now();
    let mut limited = false;
    self.expires_at.send_if_modified(|expires_at| match *expires_at {
      Some(at) if now >= at => {
        debug!("rate limit expired");
        *expires_at = None;
        true
      }
      Some(_) => {
        limited = true;
        false
      }
      None => false,
    });
    limited
  }

  /// Record a rate-limit signal lasting `duration` from now.
  ///
  /// An expiry that is already later is kept.
  pub fn set_limited(&self, duration: Duration) {
    let until = Instant::now() + duration;
    let extended = self.expires_at.send_if_modified(|expires_at| {
      if expires_at.map_or(true, |at| at < until) {
        *expires_at = Some(until);
        true
      } else {
        false
      }
    });
    if extended {
      warn!(duration_ms = duration.as_millis() as u64, "backend rate limit engaged");
    }
  }

  /// When the current limit expires, if limited.
  pub fn expires_at(&self) -> Option<Instant> {
    if self.is_limited() {
      *self.expires_at.borrow()
    } else {
      None
    }
  }

  /// Time left until the limit clears.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .expires_at()
      .map(|at| at.saturating_duration_since(Instant::now()))
  }

  /// Watch for limit changes.
  pub fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
    self.expires_at.subscribe()
  }

  /// Forget any limit. Only for session reset.
  pub(crate) fn clear(&self) {
    self.expires_at.send_replace(None);
  }
}

impl Default for RateLimitGuard {
  fn default() -> Self {
    Self::new()
  }
}
