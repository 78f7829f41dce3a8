//! The synchronization engine: one cache, one rate-limit guard, one
//! visibility signal, and a polling scheduler per subscribed key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, QueryKey, Record};
use crate::error::FetchError;

use super::binding::QueryBinding;
use super::layer::CacheLayer;
use super::policy::SyncSettings;
use super::projector::CacheProjector;
use super::rate_limit::RateLimitGuard;
use super::scheduler::{PollingScheduler, SchedulerContext, SchedulerState};
use super::transport::{Mutation, Transport};
use super::visibility::{Visibility, VisibilityController};

/// Garbage collection never runs more often than this.
const MIN_GC_PERIOD: Duration = Duration::from_secs(30);

struct SchedulerSlot {
  scheduler: PollingScheduler,
  bindings: usize,
}

struct EngineInner {
  settings: SyncSettings,
  store: CacheStore,
  guard: RateLimitGuard,
  visibility: VisibilityController,
  projector: CacheProjector,
  layer: CacheLayer,
  schedulers: Mutex<HashMap<QueryKey, SchedulerSlot>>,
  /// Bumped by `reset`; bindings from an older generation release nothing
  generation: AtomicU64,
  gc_task: JoinHandle<()>,
}

impl Drop for EngineInner {
  fn drop(&mut self) {
    self.gc_task.abort();
  }
}

/// Handle to the engine. Cheap to clone; all clones share state.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  pub fn new(settings: SyncSettings, transport: Arc<dyn Transport>) -> Self {
    let store = CacheStore::new(settings.gc_time);
    let guard = RateLimitGuard::new();
    let layer = CacheLayer::new(store.clone(), transport, guard.clone(), settings.floor);
    let gc_task = spawn_gc(store.clone(), settings.gc_time);

    info!(
      floor_secs = settings.floor.as_secs(),
      max_multiplier = settings.max_multiplier,
      gc_secs = settings.gc_time.as_secs(),
      "sync engine started"
    );

    Self {
      inner: Arc::new(EngineInner {
        projector: CacheProjector::new(store.clone()),
        visibility: VisibilityController::new(Visibility::Foreground),
        schedulers: Mutex::new(HashMap::new()),
        generation: AtomicU64::new(0),
        settings,
        store,
        guard,
        layer,
        gc_task,
      }),
    }
  }

  /// Subscribe to `key`, starting its scheduler if this is the first
  /// subscriber.
  pub fn bind(&self, key: QueryKey) -> QueryBinding {
    let (tx, rx) = watch::channel(0u64);
    let subscription = self.inner.store.subscribe(
      &key,
      Arc::new(move |_| {
        tx.send_modify(|version| *version = version.wrapping_add(1));
      }),
    );
    let generation = self.acquire(&key);
    QueryBinding::new(key, self.clone(), generation, rx, subscription)
  }

  /// Count one more binding of `key`. Returns the generation it belongs to.
  fn acquire(&self, key: &QueryKey) -> u64 {
    let mut schedulers = self.schedulers();
    let generation = self.inner.generation.load(Ordering::SeqCst);
    let slot = schedulers.entry(key.clone()).or_insert_with(|| {
      debug!(key = %key, "creating scheduler");
      let scheduler = PollingScheduler::spawn(
        key.clone(),
        self.inner.settings.policy(key.resource()),
        SchedulerContext {
          layer: self.inner.layer.clone(),
          visibility: self.inner.visibility.clone(),
          max_multiplier: self.inner.settings.max_multiplier,
        },
      );
      scheduler.start();
      SchedulerSlot {
        scheduler,
        bindings: 0,
      }
    });
    slot.bindings += 1;
    generation
  }

  /// Drop one binding of `key`; the last one tears the scheduler down.
  ///
  /// Bindings created before the last `reset` no longer own a slot.
  pub(super) fn release(&self, key: &QueryKey, generation: u64) {
    let mut schedulers = self.schedulers();
    if generation != self.inner.generation.load(Ordering::SeqCst) {
      debug!(key = %key, "ignoring release from before reset");
      return;
    }
    let Some(slot) = schedulers.get_mut(key) else {
      return;
    };
    slot.bindings = slot.bindings.saturating_sub(1);
    if slot.bindings == 0 {
      debug!(key = %key, "last subscriber gone, stopping scheduler");
      schedulers.remove(key);
    }
  }

  /// Merge `patch` into every cached copy of entity `id`, then refresh.
  ///
  /// Active views of the resource are refetched in the background; inactive
  /// ones are flagged to refetch on their next subscription.
  pub fn update_entity_in_cache(&self, resource: &str, id: &str, patch: &Record) {
    self.inner.projector.apply_entity_update(resource, id, patch);
    self.invalidate_resource(resource);
  }

  /// Insert a newly created entity into every view it belongs to.
  pub fn add_entity_to_cache(&self, resource: &str, record: &Record) {
    self.inner.projector.apply_entity_insert(resource, record);
    self.invalidate_resource(resource);
  }

  /// Remove entity `id` from every view.
  pub fn remove_entity_from_cache(&self, resource: &str, id: &str) {
    self.inner.projector.apply_entity_remove(resource, id);
    self.invalidate_resource(resource);
  }

  /// Mark every entry of `resource` as needing a refetch.
  ///
  /// Returns the number of active keys refetched.
  pub fn invalidate_resource(&self, resource: &str) -> usize {
    let active = self.inner.store.invalidate(|key| key.is_resource(resource));
    for key in active.iter().cloned() {
      let layer = self.inner.layer.clone();
      tokio::spawn(async move {
        layer.fetch(&key).await;
      });
    }
    debug!(resource, refetching = active.len(), "invalidated resource");
    active.len()
  }

  /// Send a write to the backend and project its result into the cache.
  ///
  /// Errors are returned to the caller untouched. A rate-limit response
  /// also engages the shared guard.
  pub async fn mutate(&self, resource: &str, mutation: Mutation) -> Result<Option<Record>, FetchError> {
    let result = self.inner.layer.transport().mutate(resource, &mutation).await;
    let returned = match result {
      Ok(returned) => returned,
      Err(err) => {
        if let FetchError::RateLimited { retry_after } = &err {
          self
            .inner
            .guard
            .set_limited(retry_after.unwrap_or(self.inner.settings.floor));
        }
        warn!(resource, error = %err, "mutation failed");
        return Err(err);
      }
    };

    match &mutation {
      Mutation::Create(record) => {
        self.add_entity_to_cache(resource, returned.as_ref().unwrap_or(record));
      }
      Mutation::Update { id, patch } => {
        self.update_entity_in_cache(resource, id, returned.as_ref().unwrap_or(patch));
      }
      Mutation::Delete { id } => self.remove_entity_from_cache(resource, id),
    }
    Ok(returned)
  }

  /// Move the engine to the foreground. Returns whether anything changed.
  pub fn on_foreground(&self) -> bool {
    self.inner.visibility.on_foreground()
  }

  pub fn on_background(&self) -> bool {
    self.inner.visibility.on_background()
  }

  /// Forget everything: schedulers, cached data, rate limit, and
  /// forbidden keys. Bindings created before the reset go inert: they stop
  /// receiving changes and dropping them releases nothing.
  ///
  /// Responses to requests still in flight are discarded.
  pub fn reset(&self) {
    let schedulers: Vec<_> = {
      let mut schedulers = self.schedulers();
      self.inner.generation.fetch_add(1, Ordering::SeqCst);
      schedulers.drain().collect()
    };
    self.inner.layer.new_session();
    let stopped = schedulers.len();
    drop(schedulers);
    self.inner.store.clear();
    self.inner.guard.clear();
    info!(stopped, "sync engine reset");
  }

  pub fn scheduler_state(&self, key: &QueryKey) -> Option<SchedulerState> {
    self.schedulers().get(key).map(|slot| slot.scheduler.state())
  }

  /// Current backoff multiplier of `key`'s scheduler.
  pub fn multiplier(&self, key: &QueryKey) -> Option<u32> {
    self.schedulers().get(key).map(|slot| slot.scheduler.multiplier())
  }

  /// Keys with at least one live binding.
  pub fn active_keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<_> = self.schedulers().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.inner.settings
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn guard(&self) -> &RateLimitGuard {
    &self.inner.guard
  }

  pub fn visibility(&self) -> &VisibilityController {
    &self.inner.visibility
  }

  pub(super) fn layer(&self) -> &CacheLayer {
    &self.inner.layer
  }

  fn schedulers(&self) -> MutexGuard<'_, HashMap<QueryKey, SchedulerSlot>> {
    self.inner.schedulers.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn spawn_gc(store: CacheStore, gc_time: Duration) -> JoinHandle<()> {
  let period = (gc_time / 4).max(MIN_GC_PERIOD);
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      let removed = store.collect_garbage();
      if removed > 0 {
        debug!(removed, remaining = store.len(), "collected unused cache entries");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheData, QueryStatus};
  use crate::clinic::Appointment;
  use crate::error::ErrorKind;
  use crate::sync::layer::FetchOutcome;
  use crate::sync::mock::{page, record, records, MockTransport};
  use crate::sync::policy::PollPolicy;
  use serde_json::json;

  fn settings() -> SyncSettings {
    SyncSettings {
      gc_time: Duration::from_secs(60),
      ..SyncSettings::default()
    }
    .with_policy(
      "appointments",
      PollPolicy::new(Duration::from_secs(30), Duration::from_secs(20)),
    )
  }

  fn engine() -> (SyncEngine, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    (SyncEngine::new(settings(), transport.clone()), transport)
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  fn status(data: Option<CacheData>, id: &str) -> Option<serde_json::Value> {
    data?.find(id)?.get("status").cloned()
  }

  #[tokio::test(start_paused = true)]
  async fn test_bindings_share_one_scheduler() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");

    let first = engine.bind(key.clone());
    let second = engine.bind(key.clone());
    settle().await;

    assert_eq!(transport.calls_for(&key), 1);
    assert_eq!(engine.active_keys(), vec![key.clone()]);

    drop(first);
    assert_eq!(engine.scheduler_state(&key), Some(SchedulerState::Scheduled));

    drop(second);
    assert_eq!(engine.scheduler_state(&key), None);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.calls_for(&key), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_binding_exposes_state_and_changes() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    transport.respond(&key, Ok(CacheData::Collection(records(&["A1", "A2"]))));
    transport.set_delay(Duration::from_secs(1));

    let mut binding = engine.bind(key);
    settle().await;
    assert!(binding.is_loading());
    assert!(binding.data().is_none());

    assert!(binding.changed().await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!binding.is_loading());
    assert_eq!(binding.state().status, QueryStatus::Success);
    assert_eq!(binding.data().map(|d| d.len()), Some(2));
    assert_eq!(binding.items::<Appointment>().len(), 2);
    assert!(binding.error().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_refetch_during_flight_is_noop() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    transport.set_delay(Duration::from_secs(5));

    let binding = engine.bind(key.clone());
    settle().await;
    assert!(binding.is_fetching());

    assert_eq!(binding.refetch().await, FetchOutcome::InFlight);
    assert_eq!(transport.calls_for(&key), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_update_reaches_list_detail_and_dashboard() {
    let (engine, transport) = engine();
    let list = QueryKey::page("appointments", 1, 10);
    let detail = QueryKey::detail("appointments", "A1");
    let dashboard = QueryKey::collection("appointments").with("day", "today");
    transport.respond(&list, Ok(page(&["A1", "A2"], 1, 10, 2)));
    transport.respond(
      &detail,
      Ok(CacheData::Detail(record(json!({"_id": "A1", "status": "pending"})))),
    );
    transport.respond(&dashboard, Ok(CacheData::Collection(records(&["A1"]))));

    let list_view = engine.bind(list.clone());
    let detail_view = engine.bind(detail.clone());
    let dashboard_view = engine.bind(dashboard.clone());
    settle().await;

    engine.update_entity_in_cache(
      "appointments",
      "A1",
      &record(json!({"status": "done"})),
    );

    // Visible before any request completes.
    for view in [&list_view, &detail_view, &dashboard_view] {
      assert_eq!(status(view.data(), "A1"), Some(json!("done")), "{}", view.key());
    }
    assert_eq!(status(list_view.data(), "A2"), Some(json!("pending")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_refetches_active_and_flags_inactive() {
    let (engine, transport) = engine();
    let active = QueryKey::collection("appointments");
    let inactive = QueryKey::detail("appointments", "A9");
    transport.respond(&active, Ok(CacheData::Collection(records(&["A1"]))));

    let _view = engine.bind(active.clone());
    let closed = engine.bind(inactive.clone());
    settle().await;
    drop(closed);
    assert_eq!(transport.calls_for(&active), 1);
    assert_eq!(transport.calls_for(&inactive), 1);

    engine.update_entity_in_cache("appointments", "A1", &record(json!({"status": "done"})));
    settle().await;

    assert_eq!(transport.calls_for(&active), 2);
    assert_eq!(transport.calls_for(&inactive), 1);
    assert!(engine.store().get(&inactive).invalidated);
    assert!(!engine.store().get(&active).invalidated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidated_key_refetches_on_next_subscription() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");

    let view = engine.bind(key.clone());
    settle().await;
    drop(view);
    assert_eq!(transport.calls_for(&key), 1);

    // Fresh data: resubscribing does not refetch.
    let view = engine.bind(key.clone());
    settle().await;
    drop(view);
    assert_eq!(transport.calls_for(&key), 1);

    engine.invalidate_resource("appointments");
    let _view = engine.bind(key.clone());
    settle().await;
    assert_eq!(transport.calls_for(&key), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_projects_backend_result() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    transport.respond(&key, Ok(CacheData::Collection(records(&["A1"]))));
    let view = engine.bind(key);
    settle().await;
    // Keep background refetches from landing mid-test.
    transport.set_delay(Duration::from_secs(10));

    let created = engine
      .mutate(
        "appointments",
        Mutation::Create(record(json!({"_id": "A2", "status": "pending"}))),
      )
      .await
      .unwrap();
    assert!(created.is_some());
    assert_eq!(view.data().map(|d| d.len()), Some(2));

    engine
      .mutate(
        "appointments",
        Mutation::Update {
          id: "A2".into(),
          patch: record(json!({"status": "done"})),
        },
      )
      .await
      .unwrap();
    assert_eq!(status(view.data(), "A2"), Some(json!("done")));

    engine
      .mutate("appointments", Mutation::Delete { id: "A2".into() })
      .await
      .unwrap();
    assert!(view.data().unwrap().find("A2").is_none());
    assert_eq!(transport.mutations().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_returns_validation_errors() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    transport.respond(&key, Ok(CacheData::Collection(records(&["A1"]))));
    let view = engine.bind(key);
    settle().await;

    transport.fail_mutations(FetchError::Validation {
      status: 422,
      message: "start time is in the past".into(),
    });
    let err = engine
      .mutate(
        "appointments",
        Mutation::Update {
          id: "A1".into(),
          patch: record(json!({"status": "done"})),
        },
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(status(view.data(), "A1"), Some(json!("pending")));
    assert!(!engine.guard().is_limited());
    assert_eq!(view.scheduler_state(), Some(SchedulerState::Scheduled));
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_rate_limit_engages_guard() {
    let (engine, transport) = engine();
    transport.fail_mutations(FetchError::RateLimited {
      retry_after: Some(Duration::from_secs(90)),
    });

    let result = engine
      .mutate("appointments", Mutation::Delete { id: "A1".into() })
      .await;

    assert!(matches!(result, Err(FetchError::RateLimited { .. })));
    assert!(engine.guard().is_limited());
    assert_eq!(engine.guard().remaining(), Some(Duration::from_secs(90)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_forbidden_key_reports_permission_error() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("invoices");
    transport.respond(&key, Err(FetchError::Forbidden("staff role".into())));

    let view = engine.bind(key.clone());
    settle().await;

    assert_eq!(view.error().map(|e| e.kind), Some(ErrorKind::Forbidden));
    assert_eq!(view.scheduler_state(), Some(SchedulerState::Disabled));
    assert_eq!(view.refetch().await, FetchOutcome::Forbidden);
    assert_eq!(transport.calls_for(&key), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_visibility_pauses_every_scheduler() {
    let (engine, transport) = engine();
    let appointments = QueryKey::collection("appointments");
    let clients = QueryKey::collection("clients");
    let _a = engine.bind(appointments.clone());
    let _c = engine.bind(clients.clone());
    settle().await;

    assert!(engine.on_background());
    settle().await;
    assert_eq!(engine.scheduler_state(&appointments), Some(SchedulerState::Idle));
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.total_calls(), 2);

    assert!(engine.on_foreground());
    settle().await;
    assert_eq!(transport.total_calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unused_entries_are_collected() {
    let (engine, _transport) = engine();
    let key = QueryKey::collection("appointments");
    let kept = QueryKey::collection("clients");

    let _view = engine.bind(kept.clone());
    let closed = engine.bind(key.clone());
    settle().await;
    drop(closed);
    assert!(engine.store().contains(&key));

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert!(!engine.store().contains(&key));
    assert!(engine.store().contains(&kept));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_forgets_everything() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("invoices");
    transport.push(&key, Err(FetchError::Forbidden("staff role".into())));
    let view = engine.bind(key.clone());
    settle().await;
    engine.guard().set_limited(Duration::from_secs(60));

    engine.reset();

    assert!(engine.store().is_empty());
    assert!(engine.active_keys().is_empty());
    assert!(!engine.guard().is_limited());
    drop(view);

    let _fresh = engine.bind(key.clone());
    settle().await;
    assert_eq!(transport.calls_for(&key), 2);
    assert_eq!(engine.store().get(&key).status, QueryStatus::Success);
  }
  #[tokio::test(start_paused = true)]
  async fn test_binding_from_before_reset_releases_nothing() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    let old = engine.bind(key.clone());
    settle().await;

    engine.reset();
    let fresh = engine.bind(key.clone());
    settle().await;
    drop(old);

    assert_eq!(engine.scheduler_state(&key), Some(SchedulerState::Scheduled));
    let calls = transport.calls_for(&key);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(transport.calls_for(&key) > calls);

    drop(fresh);
    assert_eq!(engine.scheduler_state(&key), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_refetches_instead_of_settling_old_response() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("appointments");
    transport.push(&key, Ok(CacheData::Collection(records(&["old"]))));
    transport.respond(&key, Ok(CacheData::Collection(records(&["new"]))));
    transport.set_delay(Duration::from_secs(5));

    let old = engine.bind(key.clone());
    settle().await;
    engine.reset();
    drop(old);

    let fresh = engine.bind(key.clone());
    settle().await;
    assert_eq!(transport.calls_for(&key), 1);
    assert!(fresh.is_loading());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.calls_for(&key), 2);
    assert!(fresh.data().is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let data = fresh.data().unwrap();
    assert!(data.find("new").is_some());
    assert!(data.find("old").is_none());
    assert_eq!(transport.calls_for(&key), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_drops_unwatched_in_flight_response() {
    let (engine, transport) = engine();
    let key = QueryKey::collection("invoices");
    transport.set_delay(Duration::from_secs(5));

    let old = engine.bind(key.clone());
    settle().await;
    engine.reset();
    drop(old);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(transport.calls_for(&key), 1);
    let state = engine.store().peek(&key).unwrap();
    assert!(!state.is_fetching());
    assert!(state.data.is_none());
  }
}
