//! Foreground/background tracking.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Whether the client is currently observed by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
  Foreground,
  Background,
}

/// Broadcasts visibility transitions to every scheduler.
///
/// Schedulers pause on [`Visibility::Background`] and, on regaining the
/// foreground, reset their backoff and refetch stale data immediately.
#[derive(Clone)]
pub struct VisibilityController {
  tx: Arc<watch::Sender<Visibility>>,
}

impl VisibilityController {
  pub fn new(initial: Visibility) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn on_foreground(&self) -> bool {
    self.set(Visibility::Foreground)
  }

  pub fn on_background(&self) -> bool {
    self.set(Visibility::Background)
  }

  /// Broadcast `visibility` if it differs from the current value.
  ///
  /// Returns whether a transition happened.
  pub fn set(&self, visibility: Visibility) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == visibility {
        false
      } else {
        *current = visibility;
        true
      }
    });
    if changed {
      info!(?visibility, "visibility changed");
    }
    changed
  }

  pub fn current(&self) -> Visibility {
    *self.tx.borrow()
  }

  pub fn is_foreground(&self) -> bool {
    self.current() == Visibility::Foreground
  }

  pub fn subscribe(&self) -> watch::Receiver<Visibility> {
    self.tx.subscribe()
  }
}

impl Default for VisibilityController {
  fn default() -> Self {
    Self::new(Visibility::Foreground)
  }
}
