//! Serde-deserializable types matching clinic backend responses.
//!
//! Records stay untyped here; typed views are built from the cache.

use serde::Deserialize;

use crate::cache::{Pagination, Record};

// ============================================================================
// List endpoints
// ============================================================================

/// `GET /{resource}?page=&limit=`
#[derive(Debug, Deserialize)]
pub struct ApiListResponse {
  #[serde(default)]
  pub data: Vec<Record>,
  pub pagination: Option<Pagination>,
}

impl ApiListResponse {
  /// Pagination as sent, or a single-page summary when the backend omits it.
  pub fn pagination_or(&self, page: u32, limit: u32) -> Pagination {
    self.pagination.unwrap_or(Pagination {
      page,
      limit,
      total: self.data.len() as u64,
      total_pages: 1,
    })
  }
}

// ============================================================================
// Single-entity endpoints
// ============================================================================

/// Detail and mutation responses, with or without a `data` envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiEntityResponse {
  Wrapped { data: Record },
  Bare(Record),
}

impl ApiEntityResponse {
  pub fn into_record(self) -> Record {
    match self {
      ApiEntityResponse::Wrapped { data } => data,
      ApiEntityResponse::Bare(record) => record,
    }
  }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  pub message: Option<String>,
  pub error: Option<String>,
}

impl ApiErrorBody {
  /// Best human-readable message from an error body.
  pub fn message_from(body: &str) -> String {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
      .message
      .or(parsed.error)
      .unwrap_or_else(|| body.trim().to_string())
  }
}
