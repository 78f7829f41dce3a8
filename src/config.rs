use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ParamValue, QueryKey};
use crate::clinic::Resource;
use crate::sync::{PollPolicy, SyncSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub polling: PollingConfig,
  /// Per-resource overrides of the polling policy
  #[serde(default)]
  pub resources: HashMap<Resource, ResourceConfig>,
  /// Views to keep in sync (defaults to every full collection)
  #[serde(default)]
  pub views: Vec<ViewConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  /// Page size used when walking a full collection
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_page_size() -> u32 {
  100
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
  /// Minimum cool-down after a 429
  #[serde(default = "default_floor_secs")]
  pub floor_secs: u64,
  #[serde(default = "default_max_multiplier")]
  pub max_multiplier: u32,
  /// How long unsubscribed views stay cached
  #[serde(default = "default_gc_secs")]
  pub gc_secs: u64,
}

fn default_floor_secs() -> u64 {
  60
}

fn default_max_multiplier() -> u32 {
  16
}

fn default_gc_secs() -> u64 {
  300
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      floor_secs: default_floor_secs(),
      max_multiplier: default_max_multiplier(),
      gc_secs: default_gc_secs(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResourceConfig {
  pub interval_secs: Option<u64>,
  pub stale_secs: Option<u64>,
}

/// One view to subscribe to.
///
/// `id` selects a detail view, `page`/`limit` a page, and `filters` a
/// filtered list. With none of them the view is the full collection.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
  pub resource: Resource,
  pub id: Option<String>,
  pub page: Option<u32>,
  pub limit: Option<u32>,
  #[serde(default)]
  pub filters: BTreeMap<String, ParamValue>,
}

impl ViewConfig {
  pub fn key(&self) -> QueryKey {
    let base = match (&self.id, self.page) {
      (Some(id), _) => return self.resource.detail(id.clone()),
      (None, Some(page)) => self.resource.page(page, self.limit.unwrap_or(20)),
      (None, None) => self.resource.collection(),
    };
    self
      .filters
      .iter()
      .fold(base, |key, (name, value)| key.with(name.clone(), value.clone()))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./clinic-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clinic-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/clinic-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("clinic-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("clinic-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.polling.max_multiplier == 0 {
      return Err(eyre!("polling.max_multiplier must be at least 1"));
    }
    Ok(config)
  }

  /// Engine settings with per-resource defaults filled in.
  pub fn sync_settings(&self) -> SyncSettings {
    let settings = SyncSettings {
      floor: Duration::from_secs(self.polling.floor_secs),
      max_multiplier: self.polling.max_multiplier,
      gc_time: Duration::from_secs(self.polling.gc_secs),
      ..SyncSettings::default()
    };
    Resource::ALL.into_iter().fold(settings, |settings, resource| {
      let default = resource.default_policy();
      let over = self.resources.get(&resource).copied().unwrap_or_default();
      let policy = PollPolicy::new(
        over
          .interval_secs
          .map_or(default.base_interval, Duration::from_secs),
        over.stale_secs.map_or(default.stale_time, Duration::from_secs),
      );
      settings.with_policy(resource.as_str(), policy)
    })
  }

  /// Keys to subscribe to at startup.
  pub fn view_keys(&self) -> Vec<QueryKey> {
    if self.views.is_empty() {
      return Resource::ALL.iter().map(Resource::collection).collect();
    }
    self.views.iter().map(ViewConfig::key).collect()
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks CLINIC_SYNC_TOKEN first, then CLINIC_API_TOKEN as fallback.
  pub fn api_token() -> Option<String> {
    std::env::var("CLINIC_SYNC_TOKEN")
      .or_else(|_| std::env::var("CLINIC_API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
