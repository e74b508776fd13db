//! Fetch interception with a network-first policy.
//!
//! 1. Cross-origin requests are not intercepted.
//! 2. Mutating requests go to the network; failures on sync routes are queued.
//! 3. Live-data requests (api prefix) go to the network, never the cache.
//! 4. Everything else is network-first: successes are written through to the
//!    current generation, network failures fall back to the cache and, for
//!    navigations, to the cached root page.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheManager;
use crate::error::{AgentError, Result};
use crate::http::{Request, RequestIdentity, Response, ResponseSource, Transport};
use crate::store::{CachedResponse, PendingOperation, Store};
use crate::sync::SyncQueue;

/// Header carrying the queue id on a synthesized "queued" response.
pub const QUEUED_HEADER: &str = "x-offline-queued";

/// Result of intercepting one request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not handled by the agent; the host performs the request itself.
  Passthrough,
  Respond {
    response: Response,
    /// Pending write-through of a network response, if one was started
    cache_write: Option<CacheWrite>,
  },
}

impl FetchOutcome {
  fn respond(response: Response) -> Self {
    Self::Respond {
      response,
      cache_write: None,
    }
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Passthrough => None,
      Self::Respond { response, .. } => Some(response),
    }
  }
}

/// Detached cache write. Dropping it leaves the write running; errors are
/// logged by the task and never reach the response path.
#[derive(Debug)]
pub struct CacheWrite {
  handle: JoinHandle<bool>,
}

impl CacheWrite {
  /// Wait for the write and report whether it was stored.
  pub async fn finished(self) -> bool {
    self.handle.await.unwrap_or(false)
  }
}

pub struct FetchInterceptor<S: Store, T: Transport> {
  origin: Url,
  api_prefix: String,
  sync_routes: Vec<String>,
  cache: CacheManager<S, T>,
  queue: SyncQueue<S, T>,
  transport: Arc<T>,
}

impl<S: Store, T: Transport> FetchInterceptor<S, T> {
  pub fn new(
    origin: Url,
    api_prefix: &str,
    sync_routes: Vec<String>,
    cache: CacheManager<S, T>,
    queue: SyncQueue<S, T>,
    transport: Arc<T>,
  ) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.to_string(),
      sync_routes,
      cache,
      queue,
      transport,
    }
  }

  /// Handle `request` against the cache generation of the version
  /// currently serving clients.
  pub async fn handle(&self, request: &Request, generation: &str) -> Result<FetchOutcome> {
    if request.url.origin() != self.origin.origin() {
      return Ok(FetchOutcome::Passthrough);
    }

    if request.is_mutating() {
      return self.send_mutating(request).await;
    }

    if self.is_live_data(request) || request.method != "GET" {
      let response = self.transport.send(request).await?;
      return Ok(FetchOutcome::respond(response));
    }

    match self.transport.send(request).await {
      Ok(response) => {
        let cache_write = self.write_through(generation, request.identity(), &response);
        Ok(FetchOutcome::Respond {
          response,
          cache_write: Some(cache_write),
        })
      }
      Err(e) if e.is_network() => self
        .fallback(request, generation, e)
        .map(FetchOutcome::respond),
      Err(e) => Err(e),
    }
  }

  fn is_live_data(&self, request: &Request) -> bool {
    request.url.path().contains(&self.api_prefix)
  }

  fn is_sync_route(&self, request: &Request) -> bool {
    let path = request.url.path();
    self.sync_routes.iter().any(|route| {
      let route = route.trim_end_matches('/');
      path == route
        || path
          .strip_prefix(route)
          .is_some_and(|rest| rest.starts_with('/'))
    })
  }

  async fn send_mutating(&self, request: &Request) -> Result<FetchOutcome> {
    match self.transport.send(request).await {
      Ok(response) => Ok(FetchOutcome::respond(response)),
      Err(e) if e.is_network() && self.is_sync_route(request) => {
        let id = self.queue.enqueue(&pending_from(request))?;
        let response = Response::new(202, "queued for sync")
          .with_header(QUEUED_HEADER, &id.to_string())
          .with_source(ResponseSource::Queued);
        Ok(FetchOutcome::respond(response))
      }
      Err(e) => Err(e),
    }
  }

  /// Spawn the write of a captured copy into `generation`.
  fn write_through(
    &self,
    generation: &str,
    identity: RequestIdentity,
    response: &Response,
  ) -> CacheWrite {
    let entry = CachedResponse::capture(response);
    let cache = self.cache.clone();
    let generation = generation.to_string();

    let handle = tokio::task::spawn_blocking(move || {
      match cache.put(&generation, &identity, &entry) {
        Ok(()) => true,
        Err(e) => {
          warn!(%identity, error = %e, "failed to cache response");
          false
        }
      }
    });

    CacheWrite { handle }
  }

  fn fallback(
    &self,
    request: &Request,
    generation: &str,
    network_error: AgentError,
  ) -> Result<Response> {
    let identity = request.identity();
    if let Some(entry) = self.cache.get(generation, &identity)? {
      debug!(%identity, "network failed, serving from cache");
      return Ok(entry.to_response(ResponseSource::Cache));
    }

    if request.is_navigation() {
      let root = RequestIdentity::get(&self.root_url());
      if let Some(entry) = self.cache.get(generation, &root)? {
        debug!(%identity, "network failed, serving offline page");
        return Ok(entry.to_response(ResponseSource::OfflineFallback));
      }
    }

    debug!(%identity, "network failed with no cached fallback");
    Err(network_error)
  }

  fn root_url(&self) -> Url {
    let mut root = self.origin.clone();
    root.set_path("/");
    root.set_query(None);
    root.set_fragment(None);
    root
  }
}

/// Capture a failed request as a queue record.
fn pending_from(request: &Request) -> PendingOperation {
  PendingOperation {
    headers: request.headers.clone(),
    body: request.body.clone(),
    ..PendingOperation::new(&request.method, request.url.as_str())
  }
}
