//! Durable record types and the store trait.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::http::{Headers, RequestIdentity, Response, ResponseSource};

/// A response captured into a cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Capture a copy of `response`.
  pub fn capture(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  pub fn to_response(&self, source: ResponseSource) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      source,
    }
  }
}

/// A mutating request that could not reach the network.
///
/// The body is kept as the exact bytes the client sent, whatever its
/// content type, and replayed unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
  pub url: String,
  pub method: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl PendingOperation {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      url: url.to_string(),
      method: method.to_ascii_uppercase(),
      headers: Headers::new(),
      body: None,
    }
  }

  #[cfg(test)]
  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }
}

/// A pending operation with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
  pub id: i64,
  pub operation: PendingOperation,
  pub queued_at: DateTime<Utc>,
}

/// Durable storage for cache generations, the sync queue and agent metadata.
///
/// Every method is atomic on its own; callers never rely on grouping
/// several calls into one transaction.
pub trait Store: Send + Sync + 'static {
  /// All known generation tags, sorted.
  fn generations(&self) -> Result<Vec<String>>;

  /// Drop a generation and all its entries. Returns whether it existed.
  fn delete_generation(&self, tag: &str) -> Result<bool>;

  fn get_entry(&self, generation: &str, identity: &RequestIdentity)
    -> Result<Option<CachedResponse>>;

  /// Insert or replace the entry for `identity` (last write wins).
  fn put_entry(
    &self,
    generation: &str,
    identity: &RequestIdentity,
    entry: &CachedResponse,
  ) -> Result<()>;

  /// Write a batch into `generation` in one transaction: either every
  /// entry is stored or none is. An empty batch only registers the
  /// generation, so it is listed while empty.
  fn put_entries(
    &self,
    generation: &str,
    entries: &[(RequestIdentity, CachedResponse)],
  ) -> Result<()>;

  /// Identities cached in a generation, ordered by URL.
  fn entries(&self, generation: &str) -> Result<Vec<RequestIdentity>>;

  /// Append an operation and return its id. Ids are never reused.
  fn enqueue(&self, operation: &PendingOperation) -> Result<i64>;

  /// Queued operations in ascending id order.
  fn pending(&self) -> Result<Vec<QueuedOperation>>;

  fn remove_pending(&self, id: i64) -> Result<bool>;

  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, tag: &str) -> Result<()>;

  fn preference(&self, key: &str) -> Result<Option<String>>;

  fn set_preference(&self, key: &str, value: &str) -> Result<()>;
}
