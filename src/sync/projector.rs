//! Fan-out of single-entity writes across every cached shape.

use tracing::debug;

use crate::cache::{
  apply_patch, record_id, CacheData, CacheStore, KeyShape, Page, QueryKey, QueryState, Record,
};

/// Applies one logical entity write to every cache entry of a resource.
///
/// All entries are touched under one store lock, so subscribers never see a
/// list and a detail view disagree. Only `data` changes: fetch status,
/// error, status and timestamps are left alone.
///
/// Inserts and removes do not repair pagination across pages; that needs a
/// real refetch.
#[derive(Clone)]
pub struct CacheProjector {
  store: CacheStore,
}

fn has_id(record: &Record, id: &str) -> bool {
  record_id(record).as_deref() == Some(id)
}

/// Whether a record satisfies a filtered view's parameters.
///
/// `strict` requires every filter field to be present on the record; a
/// lenient check only rejects fields that are present and differ.
fn matches_filters(key: &QueryKey, record: &Record, strict: bool) -> bool {
  key.filters().all(|(field, value)| match record.get(field) {
    Some(actual) => value.matches_json(actual),
    None => !strict,
  })
}

fn recount(page: &mut Page) {
  let limit = u64::from(page.pagination.limit.max(1));
  page.pagination.total_pages = page.pagination.total.div_ceil(limit) as u32;
}

impl CacheProjector {
  pub fn new(store: CacheStore) -> Self {
    Self { store }
  }

  /// Merge `patch` into every copy of entity `id`.
  ///
  /// Returns the number of cache entries touched.
  pub fn apply_entity_update(&self, resource: &str, id: &str, patch: &Record) -> usize {
    let touched = self.project(resource, |key, data| {
      let mut changed = false;
      for record in data.records_mut().iter_mut().filter(|r| has_id(r, id)) {
        apply_patch(record, patch);
        changed = true;
      }
      // A view with filters drops the record once it visibly stops matching.
      if changed && key.filters().next().is_some() {
        let keep = |r: &Record| !has_id(r, id) || matches_filters(key, r, false);
        match data {
          CacheData::Collection(items) => items.retain(keep),
          CacheData::Page(page) => {
            let before = page.items.len();
            page.items.retain(keep);
            if page.items.len() != before {
              page.pagination.total = page.pagination.total.saturating_sub(1);
              recount(page);
            }
          }
          CacheData::Detail(_) => {}
        }
      }
      changed
    });
    debug!(resource, id, touched, "projected entity update");
    touched
  }

  /// Insert (or replace) `record` in every view it belongs to.
  pub fn apply_entity_insert(&self, resource: &str, record: &Record) -> usize {
    let Some(id) = record_id(record) else {
      debug!(resource, "cannot project a record without an id");
      return 0;
    };
    let touched = self.project_with_empty(resource, |key, state| {
      if key.shape() == KeyShape::Detail {
        if key.detail_id().as_deref() != Some(id.as_str()) {
          return false;
        }
        state.data = Some(CacheData::Detail(record.clone()));
        return true;
      }
      let Some(data) = state.data.as_mut() else {
        return false;
      };
      if let Some(existing) = data.records_mut().iter_mut().find(|r| has_id(r, &id)) {
        *existing = record.clone();
        return true;
      }
      match (key.shape(), data) {
        (KeyShape::Collection, CacheData::Collection(items)) => {
          items.push(record.clone());
          true
        }
        (KeyShape::Filtered, CacheData::Collection(items)) if matches_filters(key, record, true) => {
          items.push(record.clone());
          true
        }
        (KeyShape::Page, CacheData::Page(page))
          if key.page_number().unwrap_or(1) <= 1 && matches_filters(key, record, true) =>
        {
          page.items.insert(0, record.clone());
          let limit = page.pagination.limit as usize;
          if limit > 0 && page.items.len() > limit {
            page.items.truncate(limit);
          }
          page.pagination.total += 1;
          recount(page);
          true
        }
        _ => false,
      }
    });
    debug!(resource, id = %id, touched, "projected entity insert");
    touched
  }

  /// Remove entity `id` from every view.
  pub fn apply_entity_remove(&self, resource: &str, id: &str) -> usize {
    let touched = self.project_with_empty(resource, |key, state| {
      if key.shape() == KeyShape::Detail {
        if key.detail_id().as_deref() != Some(id) || state.data.is_none() {
          return false;
        }
        state.data = None;
        return true;
      }
      match state.data.as_mut() {
        Some(CacheData::Collection(items)) => {
          let before = items.len();
          items.retain(|r| !has_id(r, id));
          items.len() != before
        }
        Some(CacheData::Page(page)) => {
          let before = page.items.len();
          page.items.retain(|r| !has_id(r, id));
          let removed = page.items.len() != before;
          if removed {
            page.pagination.total = page.pagination.total.saturating_sub(1);
            recount(page);
          }
          removed
        }
        Some(CacheData::Detail(_)) | None => false,
      }
    });
    debug!(resource, id, touched, "projected entity remove");
    touched
  }

  /// Run `f` over the data of every populated entry of `resource`.
  fn project<F>(&self, resource: &str, mut f: F) -> usize
  where
    F: FnMut(&QueryKey, &mut CacheData) -> bool,
  {
    self.project_with_empty(resource, |key, state| match state.data.as_mut() {
      Some(data) => f(key, data),
      None => false,
    })
  }

  fn project_with_empty<F>(&self, resource: &str, mut f: F) -> usize
  where
    F: FnMut(&QueryKey, &mut QueryState) -> bool,
  {
    let mut touched = 0;
    self.store.match_and_update(
      |key| key.is_resource(resource),
      |key, state| {
        if f(key, state) {
          touched += 1;
        }
      },
    );
    touched
  }
}
