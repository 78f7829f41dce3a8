//! Polling tuning.

use std::collections::HashMap;
use std::time::Duration;

/// Per-resource polling tuning.
///
/// The scheduler state machine is the same for every resource; only these
/// two numbers differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
  /// Nominal delay between scheduler ticks
  pub base_interval: Duration,
  /// Maximum data age before a tick is allowed to refetch
  pub stale_time: Duration,
}

impl PollPolicy {
  pub const fn new(base_interval: Duration, stale_time: Duration) -> Self {
    Self {
      base_interval,
      stale_time,
    }
  }
}

impl Default for PollPolicy {
  fn default() -> Self {
    Self::new(Duration::from_secs(60), Duration::from_secs(30))
  }
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  /// Minimum cool-down after a rate-limit signal
  pub floor: Duration,
  /// Upper bound of the backoff multiplier
  pub max_multiplier: u32,
  /// Retention of unsubscribed cache entries
  pub gc_time: Duration,
  /// Policy for resources without an explicit entry
  pub default_policy: PollPolicy,
  pub policies: HashMap<String, PollPolicy>,
}

impl SyncSettings {
  pub fn policy(&self, resource: &str) -> PollPolicy {
    self
      .policies
      .get(resource)
      .copied()
      .unwrap_or(self.default_policy)
  }

  pub fn with_policy(mut self, resource: impl Into<String>, policy: PollPolicy) -> Self {
    self.policies.insert(resource.into(), policy);
    self
  }
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      floor: Duration::from_secs(60),
      max_multiplier: 16,
      gc_time: Duration::from_secs(5 * 60),
      default_policy: PollPolicy::default(),
      policies: HashMap::new(),
    }
  }
}
