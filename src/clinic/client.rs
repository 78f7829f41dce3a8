use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheData, KeyShape, Page, QueryKey, Record};
use crate::clinic::api_types::{ApiEntityResponse, ApiErrorBody, ApiListResponse};
use crate::clinic::resource::Resource;
use crate::config::Config;
use crate::error::FetchError;
use crate::sync::{Mutation, Transport};

/// Stop walking a collection after this many pages.
const MAX_PAGES: u32 = 200;

/// Clinic backend REST client
#[derive(Clone)]
pub struct ClinicClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
  page_size: u32,
}

fn transient(context: &str, e: impl std::fmt::Display) -> FetchError {
  FetchError::Transient(format!("{}: {}", context, e))
}

/// URL path of a resource name used in query keys.
fn resource_path(resource: &str) -> Result<&'static str, FetchError> {
  resource
    .parse::<Resource>()
    .map(|r| r.path())
    .map_err(FetchError::Transient)
}

/// Parse a `Retry-After` header: delay seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
  let value = value.trim();
  if let Ok(secs) = value.parse::<u64>() {
    return Some(Duration::from_secs(secs));
  }
  let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
  Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

impl ClinicClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::api_token();
    if token.is_none() {
      warn!("no API token set, requests are sent unauthenticated");
    }
    Self::with_token(
      &config.backend.url,
      token,
      config.backend.page_size,
      Duration::from_secs(config.backend.timeout_secs),
    )
  }

  pub fn with_token(
    base_url: &str,
    token: Option<String>,
    page_size: u32,
    timeout: Duration,
  ) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid backend URL {}: {}", base_url, e))?;
    // Url::join drops the last segment unless the path ends in '/'.
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      token,
      page_size: page_size.max(1),
    })
  }

  fn endpoint(&self, resource: &str, id: Option<&str>) -> Result<Url, FetchError> {
    let mut url = self
      .base
      .join(resource_path(resource)?)
      .map_err(|e| transient("bad endpoint", e))?;
    if let Some(id) = id {
      url
        .path_segments_mut()
        .map_err(|_| FetchError::Transient("backend URL cannot take a path".to_string()))?
        .push(id);
    }
    Ok(url)
  }

  /// List URL for `key` with its filters plus explicit pagination.
  fn list_url(&self, key: &QueryKey, page: u32, limit: u32) -> Result<Url, FetchError> {
    let mut url = self.endpoint(key.resource(), None)?;
    {
      let mut query = url.query_pairs_mut();
      for (name, value) in key.filters() {
        query.append_pair(name, &value.to_string());
      }
      query.append_pair("page", &page.to_string());
      query.append_pair("limit", &limit.to_string());
    }
    Ok(url)
  }

  /// Send a request, turning every non-2xx status into a [`FetchError`].
  async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };
    let response = request.send().await.map_err(|e| transient("request failed", e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let retry_after = response
      .headers()
      .get(RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let err = FetchError::from_status(status.as_u16(), ApiErrorBody::message_from(&body), retry_after);
    debug!(status = status.as_u16(), error = %err, "backend returned an error");
    Err(err)
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
    let response = self.send(self.http.get(url)).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| transient("undecodable response", e))
  }

  async fn fetch_detail(&self, key: &QueryKey) -> Result<CacheData, FetchError> {
    let id = key
      .detail_id()
      .ok_or_else(|| FetchError::Transient(format!("no id in key {}", key)))?;
    let url = self.endpoint(key.resource(), Some(&id))?;
    let response: ApiEntityResponse = self.get_json(url).await?;
    Ok(CacheData::Detail(response.into_record()))
  }

  async fn fetch_page(&self, key: &QueryKey) -> Result<CacheData, FetchError> {
    let page = key
      .page_number()
      .and_then(|p| u32::try_from(p).ok())
      .unwrap_or(1);
    let limit = key
      .page_limit()
      .and_then(|l| u32::try_from(l).ok())
      .unwrap_or(self.page_size);

    let response: ApiListResponse = self.get_json(self.list_url(key, page, limit)?).await?;
    let pagination = response.pagination_or(page, limit);
    Ok(CacheData::Page(Page {
      items: response.data,
      pagination,
    }))
  }

  /// Walk every page of a list until the backend reports the last one.
  async fn fetch_all(&self, key: &QueryKey) -> Result<CacheData, FetchError> {
    let mut records: Vec<Record> = Vec::new();
    let mut page = 1u32;

    loop {
      let url = self.list_url(key, page, self.page_size)?;
      let response: ApiListResponse = self.get_json(url).await?;
      let pagination = response.pagination_or(page, self.page_size);
      let received = response.data.len();
      records.extend(response.data);

      if received == 0 || pagination.page >= pagination.total_pages {
        break;
      }
      if page >= MAX_PAGES {
        warn!(key = %key, pages = page, "collection too large, truncating");
        break;
      }
      page += 1;
    }

    debug!(key = %key, pages = page, count = records.len(), "fetched collection");
    Ok(CacheData::Collection(records))
  }

  async fn send_mutation(&self, resource: &str, mutation: &Mutation) -> Result<Option<Record>, FetchError> {
    let request = match mutation {
      Mutation::Create(record) => self.http.post(self.endpoint(resource, None)?).json(record),
      Mutation::Update { id, patch } => self.http.put(self.endpoint(resource, Some(id))?).json(patch),
      Mutation::Delete { id } => self.http.delete(self.endpoint(resource, Some(id))?),
    };
    let response = self.send(request).await?;
    if response.status() == StatusCode::NO_CONTENT {
      return Ok(None);
    }

    let body = response
      .text()
      .await
      .map_err(|e| transient("unreadable response", e))?;
    if body.trim().is_empty() {
      return Ok(None);
    }
    let parsed: ApiEntityResponse =
      serde_json::from_str(&body).map_err(|e| transient("undecodable response", e))?;
    Ok(Some(parsed.into_record()))
  }
}

impl Transport for ClinicClient {
  fn fetch<'a>(&'a self, key: &'a QueryKey) -> BoxFuture<'a, Result<CacheData, FetchError>> {
    Box::pin(async move {
      match key.shape() {
        KeyShape::Detail => self.fetch_detail(key).await,
        KeyShape::Page => self.fetch_page(key).await,
        KeyShape::Collection | KeyShape::Filtered => self.fetch_all(key).await,
      }
    })
  }

  fn mutate<'a>(
    &'a self,
    resource: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<Option<Record>, FetchError>> {
    Box::pin(self.send_mutation(resource, mutation))
  }
}
