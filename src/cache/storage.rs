//! In-memory cache store with per-key subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::{Duration, Instant};

use super::key::QueryKey;
use super::state::{FetchStatus, QueryState};

/// Change listener registered for one key.
pub type Listener = Arc<dyn Fn(&QueryState) + Send + Sync>;

struct Entry {
  state: QueryState,
  listeners: HashMap<u64, Listener>,
  /// When the entry last dropped to zero subscribers
  inactive_since: Option<Instant>,
}

impl Entry {
  fn new() -> Self {
    Self {
      state: QueryState::default(),
      listeners: HashMap::new(),
      inactive_since: Some(Instant::now()),
    }
  }
}

#[derive(Default)]
struct Inner {
  entries: HashMap<QueryKey, Entry>,
  next_listener_id: u64,
}

/// Pending notifications collected under the lock and delivered after it.
type Notifications = Vec<(Vec<Listener>, QueryState)>;

/// Map from query key to query state.
///
/// Every mutation notifies the subscribers of the touched keys. Listeners
/// are invoked after the internal lock is released, so they may call back
/// into the store.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Mutex<Inner>>,
  /// How long an unsubscribed entry is retained before collection
  gc_time: Duration,
}

impl CacheStore {
  pub fn new(gc_time: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      gc_time,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn deliver(notifications: Notifications) {
    for (listeners, state) in notifications {
      for listener in listeners {
        listener(&state);
      }
    }
  }

  fn snapshot(entry: &Entry) -> (Vec<Listener>, QueryState) {
    (entry.listeners.values().cloned().collect(), entry.state.clone())
  }

  /// Current state for `key`, creating an empty pending entry if absent.
  pub fn get(&self, key: &QueryKey) -> QueryState {
    let mut inner = self.lock();
    inner
      .entries
      .entry(key.clone())
      .or_insert_with(Entry::new)
      .state
      .clone()
  }

  /// Current state for `key` without creating it.
  pub fn peek(&self, key: &QueryKey) -> Option<QueryState> {
    self.lock().entries.get(key).map(|e| e.state.clone())
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// Atomic read-modify-write of one entry, then notify its subscribers.
  pub fn update<F>(&self, key: &QueryKey, updater: F)
  where
    F: FnOnce(&mut QueryState),
  {
    let notification = {
      let mut inner = self.lock();
      let entry = inner.entries.entry(key.clone()).or_insert_with(Entry::new);
      updater(&mut entry.state);
      Self::snapshot(entry)
    };
    Self::deliver(vec![notification]);
  }

  /// Apply `updater` to every existing entry whose key satisfies `predicate`.
  ///
  /// Returns the number of entries touched.
  pub fn match_and_update<P, F>(&self, predicate: P, mut updater: F) -> usize
  where
    P: Fn(&QueryKey) -> bool,
    F: FnMut(&QueryKey, &mut QueryState),
  {
    let notifications: Notifications = {
      let mut inner = self.lock();
      inner
        .entries
        .iter_mut()
        .filter(|(key, _)| predicate(*key))
        .map(|(key, entry)| {
          updater(key, &mut entry.state);
          Self::snapshot(entry)
        })
        .collect()
    };
    let touched = notifications.len();
    Self::deliver(notifications);
    touched
  }

  /// Mark `key` as fetching if no request is in flight for it.
  ///
  /// Returns `false` when a fetch is already in flight; the caller must not
  /// issue another request.
  pub fn begin_fetch(&self, key: &QueryKey) -> bool {
    let notification = {
      let mut inner = self.lock();
      let entry = inner.entries.entry(key.clone()).or_insert_with(Entry::new);
      if entry.state.fetch_status == FetchStatus::Fetching {
        return false;
      }
      entry.state.fetch_status = FetchStatus::Fetching;
      Self::snapshot(entry)
    };
    Self::deliver(vec![notification]);
    true
  }

  /// Register a change listener for `key`.
  ///
  /// The listener stays registered until the returned [`Subscription`]
  /// is dropped.
  pub fn subscribe(&self, key: &QueryKey, listener: Listener) -> Subscription {
    let mut inner = self.lock();
    let id = inner.next_listener_id;
    inner.next_listener_id += 1;
    let entry = inner.entries.entry(key.clone()).or_insert_with(Entry::new);
    entry.listeners.insert(id, listener);
    entry.inactive_since = None;

    Subscription {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self
      .lock()
      .entries
      .get(key)
      .map(|e| e.listeners.len())
      .unwrap_or(0)
  }

  /// All keys currently held that satisfy `predicate`.
  pub fn keys_matching<P>(&self, predicate: P) -> Vec<QueryKey>
  where
    P: Fn(&QueryKey) -> bool,
  {
    self
      .lock()
      .entries
      .keys()
      .filter(|k| predicate(*k))
      .cloned()
      .collect()
  }

  /// Invalidate every entry matching `predicate`.
  ///
  /// Entries without subscribers are flagged so they refetch on their next
  /// subscription. Entries with subscribers are returned for the caller to
  /// refetch eagerly.
  pub fn invalidate<P>(&self, predicate: P) -> Vec<QueryKey>
  where
    P: Fn(&QueryKey) -> bool,
  {
    let mut inner = self.lock();
    let mut active = Vec::new();
    for (key, entry) in inner.entries.iter_mut().filter(|(k, _)| predicate(*k)) {
      if entry.listeners.is_empty() {
        entry.state.invalidated = true;
      } else {
        active.push(key.clone());
      }
    }
    active
  }

  /// Evict entries that have had no subscribers for longer than the
  /// retention window. In-flight entries are never evicted.
  ///
  /// Returns the number of entries removed.
  pub fn collect_garbage(&self) -> usize {
    let now = Instant::now();
    let gc_time = self.gc_time;
    let mut inner = self.lock();
    let before = inner.entries.len();
    inner.entries.retain(|_, entry| {
      let expired = entry.listeners.is_empty()
        && entry.state.fetch_status == FetchStatus::Idle
        && entry
          .inactive_since
          .is_some_and(|since| now.saturating_duration_since(since) >= gc_time);
      !expired
    });
    before - inner.entries.len()
  }

  pub fn gc_time(&self) -> Duration {
    self.gc_time
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every entry and listener.
  ///
  /// Keys with a request in flight keep an empty entry still marked as
  /// fetching, so the next subscriber waits for that request instead of
  /// sending another.
  pub fn clear(&self) {
    let now = Instant::now();
    let mut inner = self.lock();
    inner
      .entries
      .retain(|_, entry| entry.state.fetch_status == FetchStatus::Fetching);
    for entry in inner.entries.values_mut() {
      entry.state = QueryState {
        fetch_status: FetchStatus::Fetching,
        ..QueryState::default()
      };
      entry.listeners.clear();
      entry.inactive_since = Some(now);
    }
  }
}

/// Handle to a registered listener; unsubscribes on drop.
pub struct Subscription {
  store: Weak<Mutex<Inner>>,
  key: QueryKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(store) = self.store.upgrade() else {
      return;
    };
    let mut inner = store.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = inner.entries.get_mut(&self.key) {
      entry.listeners.remove(&self.id);
      if entry.listeners.is_empty() {
        entry.inactive_since = Some(Instant::now());
      }
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::data::CacheData;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let listener: Listener = Arc::new(move |_| {
      c.fetch_add(1, Ordering::SeqCst);
    });
    (listener, count)
  }

  #[test]
  fn test_get_creates_pending_entry() {
    let store = CacheStore::new(Duration::from_secs(300));
    let key = QueryKey::collection("clients");
    assert!(!store.contains(&key));
    let state = store.get(&key);
    assert!(state.data.is_none());
    assert!(store.contains(&key));
  }

  #[test]
  fn test_update_notifies_only_that_key() {
    let store = CacheStore::new(Duration::from_secs(300));
    let a = QueryKey::collection("clients");
    let b = QueryKey::collection("invoices");
    let (listener_a, count_a) = counting_listener();
    let (listener_b, count_b) = counting_listener();
    let _sa = store.subscribe(&a, listener_a);
    let _sb = store.subscribe(&b, listener_b);

    store.update(&a, |s| s.data = Some(CacheData::Collection(Vec::new())));

    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_dropping_subscription_unsubscribes() {
    let store = CacheStore::new(Duration::from_secs(300));
    let key = QueryKey::collection("clients");
    let (listener, count) = counting_listener();
    let sub = store.subscribe(&key, listener);
    assert_eq!(store.subscriber_count(&key), 1);

    drop(sub);
    store.update(&key, |s| s.invalidated = true);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(store.subscriber_count(&key), 0);
  }

  #[test]
  fn test_match_and_update_by_resource() {
    let store = CacheStore::new(Duration::from_secs(300));
    store.get(&QueryKey::collection("appointments"));
    store.get(&QueryKey::page("appointments", 1, 10));
    store.get(&QueryKey::collection("clients"));

    let touched = store.match_and_update(|k| k.is_resource("appointments"), |_, s| {
      s.invalidated = true;
    });

    assert_eq!(touched, 2);
    assert!(!store.get(&QueryKey::collection("clients")).invalidated);
  }

  #[test]
  fn test_begin_fetch_is_single_flight() {
    let store = CacheStore::new(Duration::from_secs(300));
    let key = QueryKey::collection("appointments");
    assert!(store.begin_fetch(&key));
    assert!(!store.begin_fetch(&key));
    store.update(&key, |s| s.fetch_status = FetchStatus::Idle);
    assert!(store.begin_fetch(&key));
  }

  #[test]
  fn test_clear_keeps_in_flight_markers() {
    let store = CacheStore::new(Duration::from_secs(300));
    let settled = QueryKey::collection("clients");
    let in_flight = QueryKey::collection("invoices");
    store.update(&settled, |s| s.data = Some(CacheData::Collection(Vec::new())));
    assert!(store.begin_fetch(&in_flight));
    store.update(&in_flight, |s| s.data = Some(CacheData::Collection(Vec::new())));
    let (listener, _) = counting_listener();
    let _sub = store.subscribe(&in_flight, listener);

    store.clear();

    assert!(!store.contains(&settled));
    assert!(store.peek(&in_flight).unwrap().data.is_none());
    assert_eq!(store.subscriber_count(&in_flight), 0);
    assert!(!store.begin_fetch(&in_flight));
  }

  #[test]
  fn test_listener_may_reenter_store() {
    let store = CacheStore::new(Duration::from_secs(300));
    let key = QueryKey::collection("clients");
    let inner_store = store.clone();
    let inner_key = key.clone();
    let _sub = store.subscribe(
      &key,
      Arc::new(move |_| {
        let _ = inner_store.peek(&inner_key);
      }),
    );
    store.update(&key, |s| s.invalidated = true);
  }

  #[test]
  fn test_invalidate_splits_active_and_inactive() {
    let store = CacheStore::new(Duration::from_secs(300));
    let active = QueryKey::page("invoices", 1, 10);
    let inactive = QueryKey::page("invoices", 2, 10);
    let (listener, _) = counting_listener();
    let _sub = store.subscribe(&active, listener);
    store.get(&inactive);

    let refetch = store.invalidate(|k| k.is_resource("invoices"));

    assert_eq!(refetch, vec![active.clone()]);
    assert!(store.get(&inactive).invalidated);
    assert!(!store.get(&active).invalidated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_garbage_collection_respects_retention_and_flight() {
    let store = CacheStore::new(Duration::from_secs(60));
    let idle = QueryKey::collection("clients");
    let in_flight = QueryKey::collection("invoices");
    let watched = QueryKey::collection("appointments");
    store.get(&idle);
    assert!(store.begin_fetch(&in_flight));
    let (listener, _) = counting_listener();
    let _sub = store.subscribe(&watched, listener);

    assert_eq!(store.collect_garbage(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(store.collect_garbage(), 1);
    assert!(!store.contains(&idle));
    assert!(store.contains(&in_flight));
    assert!(store.contains(&watched));
  }
}
