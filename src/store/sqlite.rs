//! SQLite-backed store implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{CachedResponse, PendingOperation, QueuedOperation, Store};
use crate::error::{AgentError, Result};
use crate::http::{Headers, RequestIdentity};

const ACTIVE_VERSION_KEY: &str = "active_version";

/// SQLite-based store. One connection guarded by a mutex; every trait
/// method holds the lock for a single statement or transaction.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        AgentError::InvalidState(format!(
          "failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened store");
    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Default database path under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("offline-agent").join("agent.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self.lock()?.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| AgentError::StoreLock(e.to_string()))
  }
}

/// Schema for all agent tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    tag TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Captured responses, one row per (generation, request identity)
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, cache_key)
);

-- AUTOINCREMENT keeps ids monotonic even after the newest row is deleted
CREATE TABLE IF NOT EXISTS pending_sync (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    queued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl Store for SqliteStore {
  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT tag FROM cache_generations
       UNION
       SELECT DISTINCT generation FROM cache_entries
       ORDER BY 1",
    )?;
    let tags = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tags)
  }

  fn delete_generation(&self, tag: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let entries = tx.execute("DELETE FROM cache_entries WHERE generation = ?", params![tag])?;
    let generations = tx.execute("DELETE FROM cache_generations WHERE tag = ?", params![tag])?;
    tx.commit()?;
    Ok(entries + generations > 0)
  }

  fn get_entry(
    &self,
    generation: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND cache_key = ?",
        params![generation, identity.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        status,
        headers: serde_json::from_str::<Headers>(&headers)?,
        body,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put_entry(
    &self,
    generation: &str,
    identity: &RequestIdentity,
    entry: &CachedResponse,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    insert_entry(&tx, generation, identity, entry)?;
    tx.commit()?;
    Ok(())
  }

  fn put_entries(
    &self,
    generation: &str,
    entries: &[(RequestIdentity, CachedResponse)],
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    for (identity, entry) in entries {
      insert_entry(&tx, generation, identity, entry)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn entries(&self, generation: &str) -> Result<Vec<RequestIdentity>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT method, url FROM cache_entries WHERE generation = ? ORDER BY url, method",
    )?;
    let identities = stmt
      .query_map(params![generation], |row| {
        Ok(RequestIdentity {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })?
      .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(identities)
  }

  fn enqueue(&self, operation: &PendingOperation) -> Result<i64> {
    let headers = serde_json::to_string(&operation.headers)?;
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO pending_sync (url, method, headers, body, queued_at) VALUES (?, ?, ?, ?, ?)",
      params![
        operation.url,
        operation.method,
        headers,
        operation.body,
        Utc::now().to_rfc3339()
      ],
    )?;
    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<QueuedOperation>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, url, method, headers, body, queued_at FROM pending_sync ORDER BY id ASC",
    )?;
    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, String>(5)?,
        ))
      })?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, queued_at)| -> Result<QueuedOperation> {
        Ok(QueuedOperation {
          id,
          operation: PendingOperation {
            url,
            method,
            headers: serde_json::from_str(&headers)?,
            body,
          },
          queued_at: parse_datetime(&queued_at)?,
        })
      })
      .collect()
  }

  fn remove_pending(&self, id: i64) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM pending_sync WHERE id = ?", params![id])?;
    Ok(removed > 0)
  }

  fn active_version(&self) -> Result<Option<String>> {
    let value = self
      .lock()?
      .query_row(
        "SELECT value FROM agent_meta WHERE key = ?",
        params![ACTIVE_VERSION_KEY],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_active_version(&self, tag: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO agent_meta (key, value) VALUES (?, ?)",
      params![ACTIVE_VERSION_KEY, tag],
    )?;
    Ok(())
  }

  fn preference(&self, key: &str) -> Result<Option<String>> {
    let value = self
      .lock()?
      .query_row(
        "SELECT value FROM preferences WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_preference(&self, key: &str, value: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO preferences (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn insert_generation(tx: &Transaction<'_>, generation: &str) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO cache_generations (tag, created_at) VALUES (?, ?)",
    params![generation, Utc::now().to_rfc3339()],
  )?;
  Ok(())
}

fn insert_entry(
  tx: &Transaction<'_>,
  generation: &str,
  identity: &RequestIdentity,
  entry: &CachedResponse,
) -> Result<()> {
  tx.execute(
    "INSERT OR REPLACE INTO cache_entries
       (generation, cache_key, method, url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      generation,
      identity.cache_key(),
      identity.method,
      identity.url,
      entry.status,
      serde_json::to_string(&entry.headers)?,
      entry.body,
      entry.cached_at.to_rfc3339(),
    ],
  )?;
  Ok(())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| AgentError::InvalidState(format!("bad timestamp '{}': {}", s, e)))
}
