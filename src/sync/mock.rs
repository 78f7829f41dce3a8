//! Scripted in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::cache::{CacheData, KeyShape, Page, Pagination, QueryKey, Record};
use crate::error::FetchError;

use super::transport::{Mutation, Transport};

type Response = Result<CacheData, FetchError>;

/// Build records with the given ids and a default `status` field.
pub fn records(ids: &[&str]) -> Vec<Record> {
  ids.iter().map(|id| record(json!({"_id": id, "status": "pending"}))).collect()
}

pub fn record(value: Value) -> Record {
  match value {
    Value::Object(map) => map,
    other => panic!("expected an object, got {}", other),
  }
}

pub fn page(ids: &[&str], page: u32, limit: u32, total: u64) -> CacheData {
  CacheData::Page(Page {
    items: records(ids),
    pagination: Pagination {
      page,
      limit,
      total,
      total_pages: total.div_ceil(u64::from(limit)) as u32,
    },
  })
}

#[derive(Default)]
pub struct MockTransport {
  /// One-shot responses, consumed before the sticky ones
  queued: Mutex<HashMap<QueryKey, VecDeque<Response>>>,
  sticky: Mutex<HashMap<QueryKey, Response>>,
  calls: Mutex<Vec<QueryKey>>,
  mutations: Mutex<Vec<(String, Mutation)>>,
  mutation_error: Mutex<Option<FetchError>>,
  delay: Mutex<Duration>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer every fetch of `key` with `response` until replaced.
  pub fn respond(&self, key: &QueryKey, response: Response) {
    self.sticky.lock().unwrap().insert(key.clone(), response);
  }

  /// Answer the next fetch of `key` with `response`.
  pub fn push(&self, key: &QueryKey, response: Response) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(key.clone())
      .or_default()
      .push_back(response);
  }

  pub fn fail_mutations(&self, error: FetchError) {
    *self.mutation_error.lock().unwrap() = Some(error);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn calls_for(&self, key: &QueryKey) -> usize {
    self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn mutations(&self) -> Vec<(String, Mutation)> {
    self.mutations.lock().unwrap().clone()
  }

  fn next_response(&self, key: &QueryKey) -> Response {
    if let Some(response) = self
      .queued
      .lock()
      .unwrap()
      .get_mut(key)
      .and_then(|q| q.pop_front())
    {
      return response;
    }
    if let Some(response) = self.sticky.lock().unwrap().get(key) {
      return response.clone();
    }
    Ok(match key.shape() {
      KeyShape::Detail => CacheData::Detail(record(json!({ "_id": key.detail_id() }))),
      KeyShape::Page => page(&[], 1, 10, 0),
      KeyShape::Collection | KeyShape::Filtered => CacheData::Collection(Vec::new()),
    })
  }
}

impl Transport for MockTransport {
  fn fetch<'a>(&'a self, key: &'a QueryKey) -> BoxFuture<'a, Result<CacheData, FetchError>> {
    self.calls.lock().unwrap().push(key.clone());
    let response = self.next_response(key);
    let delay = *self.delay.lock().unwrap();
    Box::pin(async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      response
    })
  }

  fn mutate<'a>(
    &'a self,
    resource: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<Option<Record>, FetchError>> {
    self
      .mutations
      .lock()
      .unwrap()
      .push((resource.to_string(), mutation.clone()));
    let error = self.mutation_error.lock().unwrap().clone();
    Box::pin(async move {
      if let Some(error) = error {
        return Err(error);
      }
      Ok(match mutation {
        Mutation::Create(record) => Some(record.clone()),
        Mutation::Update { id, patch } => {
          let mut echoed = patch.clone();
          echoed.insert("_id".to_string(), Value::String(id.clone()));
          Some(echoed)
        }
        Mutation::Delete { .. } => None,
      })
    })
  }
}
