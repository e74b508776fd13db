//! Cache manager: generation population, eviction and direct access.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::error::{AgentError, Result};
use crate::http::{Request, RequestIdentity, Transport};
use crate::store::{CachedResponse, Store};

/// Manages cache generations on top of the persistent store.
///
/// The manager keeps no state of its own; every read and write goes
/// through the store.
pub struct CacheManager<S: Store, T: Transport> {
  store: Arc<S>,
  transport: Arc<T>,
}

impl<S: Store, T: Transport> CacheManager<S, T> {
  pub fn new(store: Arc<S>, transport: Arc<T>) -> Self {
    Self { store, transport }
  }

  /// Fetch every manifest URL and write the responses into `generation`.
  ///
  /// All-or-nothing: every URL is fetched before anything is written, so a
  /// single unreachable URL (or non-2xx answer) leaves the store untouched.
  /// Returns the number of entries written.
  pub async fn precache(&self, generation: &str, manifest: &[Url]) -> Result<usize> {
    let unique: BTreeSet<&Url> = manifest.iter().collect();
    info!(generation, urls = unique.len(), "precaching manifest");

    let fetches = unique.into_iter().map(|url| {
      let request = Request::new("GET", url.clone());
      async move {
        let response = self
          .transport
          .send(&request)
          .await
          .map_err(|e| AgentError::Precache {
            url: url.to_string(),
            reason: e.to_string(),
          })?;
        if !response.is_success() {
          return Err(AgentError::Precache {
            url: url.to_string(),
            reason: format!("status {}", response.status),
          });
        }
        Ok((request.identity(), CachedResponse::capture(&response)))
      }
    });

    let captured = join_all(fetches)
      .await
      .into_iter()
      .collect::<Result<Vec<_>>>()?;

    self.store.put_entries(generation, &captured)?;
    debug!(generation, entries = captured.len(), "precached");

    Ok(captured.len())
  }

  /// Delete every generation other than `current`. Returns the deleted tags.
  pub fn purge_stale(&self, current: &str) -> Result<Vec<String>> {
    let mut purged = Vec::new();
    for tag in self.store.generations()? {
      if tag == current {
        continue;
      }
      if self.store.delete_generation(&tag)? {
        info!(generation = %tag, "deleted stale cache generation");
        purged.push(tag);
      }
    }
    Ok(purged)
  }

  pub fn get(
    &self,
    generation: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>> {
    self.store.get_entry(generation, identity)
  }

  pub fn put(
    &self,
    generation: &str,
    identity: &RequestIdentity,
    entry: &CachedResponse,
  ) -> Result<()> {
    self.store.put_entry(generation, identity, entry)
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }
}

impl<S: Store, T: Transport> Clone for CacheManager<S, T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      transport: Arc::clone(&self.transport),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::parse_url;
  use crate::http::testing::MockTransport;
  use crate::store::SqliteStore;

  fn manager() -> (CacheManager<SqliteStore, MockTransport>, Arc<MockTransport>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    (CacheManager::new(store, Arc::clone(&transport)), transport)
  }

  fn urls(list: &[&str]) -> Vec<Url> {
    list.iter().map(|u| parse_url(u).unwrap()).collect()
  }

  #[tokio::test]
  async fn precache_writes_every_manifest_url() {
    let (manager, transport) = manager();
    transport.respond("https://app.test/", 200, "home");
    transport.respond("https://app.test/css/output.css", 200, "body{}");

    let written = manager
      .precache("v1", &urls(&["https://app.test/", "https://app.test/css/output.css"]))
      .await
      .unwrap();

    assert_eq!(written, 2);
    let root = RequestIdentity::get(&parse_url("https://app.test/").unwrap());
    assert_eq!(manager.get("v1", &root).unwrap().unwrap().body, b"home");
  }

  #[tokio::test]
  async fn precache_is_all_or_nothing() {
    let (manager, transport) = manager();
    transport.respond("https://app.test/", 200, "home");
    transport.fail("https://app.test/images/logoniba.png");

    let err = manager
      .precache("v1", &urls(&["https://app.test/", "https://app.test/images/logoniba.png"]))
      .await
      .unwrap_err();

    match err {
      AgentError::Precache { url, .. } => assert_eq!(url, "https://app.test/images/logoniba.png"),
      other => panic!("unexpected error: {other}"),
    }
    assert!(manager.store().generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn precache_rejects_http_error_status() {
    let (manager, transport) = manager();
    transport.respond("https://app.test/", 404, "missing");

    let result = manager.precache("v1", &urls(&["https://app.test/"])).await;
    assert!(matches!(result, Err(AgentError::Precache { .. })));
  }

  #[tokio::test]
  async fn precache_twice_yields_same_entries() {
    let (manager, transport) = manager();
    transport.respond("https://app.test/", 200, "home");
    transport.respond("https://app.test/css/output.css", 200, "body{}");
    let manifest = urls(&[
      "https://app.test/",
      "https://app.test/css/output.css",
      "https://app.test/",
    ]);

    manager.precache("v1", &manifest).await.unwrap();
    let first = manager.store().entries("v1").unwrap();
    manager.precache("v1", &manifest).await.unwrap();
    let second = manager.store().entries("v1").unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
  }

  #[test]
  fn purge_stale_keeps_only_current() {
    let (manager, _) = manager();
    let store = manager.store();
    store.put_entries("v0", &[]).unwrap();
    store.put_entries("v1", &[]).unwrap();
    store.put_entries("v2", &[]).unwrap();

    let purged = manager.purge_stale("v2").unwrap();
    assert_eq!(purged, vec!["v0", "v1"]);
    assert_eq!(store.generations().unwrap(), vec!["v2"]);

    assert!(manager.purge_stale("v2").unwrap().is_empty());
  }
}
