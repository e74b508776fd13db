//! Error taxonomy shared by every agent component.

use thiserror::Error;

/// Errors raised by the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
  /// Transport-level failure. HTTP error statuses are responses, not this.
  #[error("network error: {0}")]
  Network(String),

  #[error("no cache entry for {0}")]
  CacheMiss(String),

  /// A manifest URL could not be fetched during install.
  #[error("precache failed for {url}: {reason}")]
  Precache { url: String, reason: String },

  /// Replay of a queued operation failed; the operation stays queued.
  #[error("replay of operation {id} failed: {reason}")]
  Replay { id: i64, reason: String },

  #[error("store error: {0}")]
  Store(#[from] rusqlite::Error),

  #[error("store lock poisoned: {0}")]
  StoreLock(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("invalid url {url}: {reason}")]
  InvalidUrl { url: String, reason: String },

  #[error("invalid lifecycle state: {0}")]
  InvalidState(String),
}

impl AgentError {
  /// Whether the error came from the network layer rather than local state.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}

pub type Result<T> = std::result::Result<T, AgentError>;
