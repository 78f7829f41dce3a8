//! Exponential backoff multiplier.

use std::time::Duration;

/// Per-scheduler backoff multiplier, bounded to `[1, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  multiplier: u32,
  max: u32,
}

impl Backoff {
  pub fn new(max: u32) -> Self {
    Self {
      multiplier: 1,
      max: max.max(1),
    }
  }

  pub fn multiplier(&self) -> u32 {
    self.multiplier
  }

  /// Double the multiplier on a rate-limit signal, up to the ceiling.
  pub fn escalate(&mut self) -> u32 {
    self.multiplier = self.multiplier.saturating_mul(2).min(self.max);
    self.multiplier
  }

  /// Back to 1 after a success or regained visibility.
  pub fn reset(&mut self) {
    self.multiplier = 1;
  }

  /// Normal delay between ticks.
  pub fn interval(&self, base: Duration) -> Duration {
    base.saturating_mul(self.multiplier)
  }

  /// Cool-down after a rate-limit signal: never shorter than `floor`.
  pub fn cooldown(&self, base: Duration, floor: Duration) -> Duration {
    self.interval(base).max(floor)
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Self::new(16)
  }
}
