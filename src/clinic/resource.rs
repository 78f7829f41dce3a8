use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::QueryKey;
use crate::sync::PollPolicy;

/// Server collections the dashboard keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
  Appointments,
  Clients,
  Invoices,
  TreatmentStages,
}

impl Resource {
  pub const ALL: [Resource; 4] = [
    Resource::Appointments,
    Resource::Clients,
    Resource::Invoices,
    Resource::TreatmentStages,
  ];

  /// Name used in query keys and config files.
  pub fn as_str(&self) -> &'static str {
    match self {
      Resource::Appointments => "appointments",
      Resource::Clients => "clients",
      Resource::Invoices => "invoices",
      Resource::TreatmentStages => "treatment_stages",
    }
  }

  /// URL path segment on the backend.
  pub fn path(&self) -> &'static str {
    match self {
      Resource::TreatmentStages => "treatment-stages",
      other => other.as_str(),
    }
  }

  /// Polling tuning when the config file doesn't override it.
  ///
  /// Appointments and treatment stages change during the day; client
  /// records rarely do.
  pub fn default_policy(&self) -> PollPolicy {
    let (interval, stale) = match self {
      Resource::Appointments | Resource::TreatmentStages => (30, 20),
      Resource::Invoices => (60, 30),
      Resource::Clients => (120, 60),
    };
    PollPolicy::new(Duration::from_secs(interval), Duration::from_secs(stale))
  }

  pub fn collection(&self) -> QueryKey {
    QueryKey::collection(self.as_str())
  }

  pub fn page(&self, page: u32, limit: u32) -> QueryKey {
    QueryKey::page(self.as_str(), page, limit)
  }

  pub fn detail(&self, id: impl Into<String>) -> QueryKey {
    QueryKey::detail(self.as_str(), id)
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Resource {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Resource::ALL
      .into_iter()
      .find(|r| r.as_str() == s || r.path() == s)
      .ok_or_else(|| format!("unknown resource: {}", s))
  }
}
