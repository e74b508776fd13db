//! Deferred sync queue: failed mutating requests are persisted and
//! replayed when a sync trigger fires.
//!
//! Delivery is at-least-once. An operation is deleted only after its replay
//! reached the server, so a crash mid-drain leaves the rest queued.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::http::{parse_url, Request, Transport};
use crate::store::{PendingOperation, QueuedOperation, Store};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Ids left in the queue after a failed replay
  pub failed_ids: Vec<i64>,
}

/// Persists and replays pending operations.
pub struct SyncQueue<S: Store, T: Transport> {
  store: Arc<S>,
  transport: Arc<T>,
  sync_tag: String,
  /// Serializes drain passes so overlapping triggers never replay twice
  draining: Arc<Mutex<()>>,
}

impl<S: Store, T: Transport> SyncQueue<S, T> {
  pub fn new(store: Arc<S>, transport: Arc<T>, sync_tag: &str) -> Self {
    Self {
      store,
      transport,
      sync_tag: sync_tag.to_string(),
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// Append an operation; the store assigns its id.
  pub fn enqueue(&self, operation: &PendingOperation) -> Result<i64> {
    let id = self.store.enqueue(operation)?;
    info!(id, method = %operation.method, url = %operation.url, "queued operation for sync");
    Ok(id)
  }

  pub fn pending(&self) -> Result<Vec<QueuedOperation>> {
    self.store.pending()
  }

  /// Replay every queued operation in ascending id order.
  ///
  /// A failed replay leaves its operation queued and the pass moves on to
  /// the next id. Failures are reported, never raised.
  pub async fn drain(&self, tag: &str) -> DrainReport {
    let mut report = DrainReport::default();

    if tag != self.sync_tag {
      debug!(tag, expected = %self.sync_tag, "ignoring sync trigger");
      return report;
    }

    let _guard = self.draining.lock().await;

    let queued = match self.store.pending() {
      Ok(queued) => queued,
      Err(e) => {
        error!(error = %e, "failed to read sync queue");
        return report;
      }
    };
    info!(tag, pending = queued.len(), "draining sync queue");

    for item in queued {
      match self.replay(&item).await {
        Ok(status) => {
          report.succeeded += 1;
          debug!(id = item.id, status, "replayed operation");
          if let Err(e) = self.store.remove_pending(item.id) {
            warn!(id = item.id, error = %e, "replayed operation could not be removed");
          }
        }
        Err(e) => {
          report.failed += 1;
          report.failed_ids.push(item.id);
          warn!(id = item.id, error = %e, "sync failed, operation stays queued");
        }
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      "sync drain finished"
    );
    report
  }

  /// Send the stored request. Any HTTP answer counts as delivered.
  async fn replay(&self, item: &QueuedOperation) -> Result<u16> {
    let op = &item.operation;
    let to_replay_error = |reason: String| AgentError::Replay {
      id: item.id,
      reason,
    };

    let url = parse_url(&op.url).map_err(|e| to_replay_error(e.to_string()))?;
    let mut request = Request::new(&op.method, url);
    request.headers = op.headers.clone();
    request.body = op.body.clone();

    let response = self
      .transport
      .send(&request)
      .await
      .map_err(|e| to_replay_error(e.to_string()))?;
    Ok(response.status)
  }
}

impl<S: Store, T: Transport> Clone for SyncQueue<S, T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      transport: Arc::clone(&self.transport),
      sync_tag: self.sync_tag.clone(),
      draining: Arc::clone(&self.draining),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::testing::{MockTransport, Reply};
  use crate::store::SqliteStore;
  use serde_json::json;

  const TAG: &str = "sync-prayers";

  fn queue() -> (SyncQueue<SqliteStore, MockTransport>, Arc<MockTransport>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    (SyncQueue::new(store, Arc::clone(&transport), TAG), transport)
  }

  fn op(path: &str) -> PendingOperation {
    PendingOperation::new("POST", &format!("https://app.test{}", path))
      .with_header("Content-Type", "application/json")
      .with_body(json!({"path": path}).to_string())
  }

  #[tokio::test]
  async fn failed_middle_operation_stays_queued() {
    let (queue, transport) = queue();
    let first = queue.enqueue(&op("/user/prayers/1")).unwrap();
    let second = queue.enqueue(&op("/user/prayers/2")).unwrap();
    let third = queue.enqueue(&op("/user/prayers/3")).unwrap();
    transport.respond("https://app.test/user/prayers/1", 200, "ok");
    transport.fail("https://app.test/user/prayers/2");
    transport.respond("https://app.test/user/prayers/3", 200, "ok");

    let report = queue.drain(TAG).await;

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_ids, vec![second]);
    let remaining: Vec<i64> = queue.pending().unwrap().iter().map(|q| q.id).collect();
    assert_eq!(remaining, vec![second]);
    assert!(first < second && second < third);
  }

  #[tokio::test]
  async fn later_operations_are_attempted_after_a_failure() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/prayers/1")).unwrap();
    queue.enqueue(&op("/user/prayers/2")).unwrap();
    queue.enqueue(&op("/user/prayers/3")).unwrap();
    transport.respond("https://app.test/user/prayers/1", 200, "ok");
    transport.fail("https://app.test/user/prayers/2");
    transport.respond("https://app.test/user/prayers/3", 200, "ok");

    queue.drain(TAG).await;

    assert_eq!(
      transport.requests(),
      vec![
        "POST https://app.test/user/prayers/1",
        "POST https://app.test/user/prayers/2",
        "POST https://app.test/user/prayers/3",
      ]
    );
  }

  #[tokio::test]
  async fn replay_sends_stored_method_headers_and_body() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/fasting")).unwrap();
    transport.respond("https://app.test/user/fasting", 201, "");

    queue.drain(TAG).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].headers.get("content-type").unwrap(), "application/json");
    let body: serde_json::Value = serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body, json!({"path": "/user/fasting"}));
  }

  #[tokio::test]
  async fn http_error_status_counts_as_delivered() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/quran")).unwrap();
    transport.respond("https://app.test/user/quran", 500, "boom");

    let report = queue.drain(TAG).await;

    assert_eq!(report.succeeded, 1);
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn other_tags_do_not_drain() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/amaliah")).unwrap();

    let report = queue.drain("sync-other").await;

    assert_eq!(report, DrainReport::default());
    assert!(transport.requests().is_empty());
    assert_eq!(queue.pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn failed_operation_succeeds_on_next_drain() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/prayers")).unwrap();
    transport.script(
      "https://app.test/user/prayers",
      vec![Reply::Fail, Reply::Respond(200, Vec::new())],
    );

    assert_eq!(queue.drain(TAG).await.failed, 1);
    assert_eq!(queue.pending().unwrap().len(), 1);

    assert_eq!(queue.drain(TAG).await.succeeded, 1);
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn concurrent_drains_replay_each_operation_once() {
    let (queue, transport) = queue();
    queue.enqueue(&op("/user/prayers/1")).unwrap();
    queue.enqueue(&op("/user/prayers/2")).unwrap();
    transport.respond("https://app.test/user/prayers/1", 200, "ok");
    transport.respond("https://app.test/user/prayers/2", 200, "ok");

    let (a, b) = tokio::join!(queue.drain(TAG), queue.drain(TAG));

    assert_eq!(a.succeeded + b.succeeded, 2);
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn enqueue_during_drain_keeps_ids_unique() {
    let (queue, transport) = queue();
    let first = queue.enqueue(&op("/user/prayers/1")).unwrap();
    transport.respond("https://app.test/user/prayers/1", 200, "ok");
    transport.respond("https://app.test/user/prayers/2", 200, "ok");
    let gate = transport.hold("https://app.test/user/prayers/1");

    let draining = tokio::spawn({
      let queue = queue.clone();
      async move { queue.drain(TAG).await }
    });

    // The first replay is in flight; the pass has already read the queue.
    gate.entered.notified().await;
    let second = queue.enqueue(&op("/user/prayers/2")).unwrap();
    gate.release.notify_one();
    let report = draining.await.unwrap();

    assert!(second > first);
    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.requests(), vec!["POST https://app.test/user/prayers/1"]);
    let ids: Vec<i64> = queue.pending().unwrap().iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![second]);

    assert_eq!(queue.drain(TAG).await.succeeded, 1);
    assert!(queue.pending().unwrap().is_empty());
  }
}
