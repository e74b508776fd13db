//! Install/activate lifecycle of one deployed agent version.

use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info};
use url::Url;

use crate::cache::CacheManager;
use crate::error::{AgentError, Result};
use crate::http::Transport;
use crate::notify::Clients;
use crate::store::Store;

/// Lifecycle state of this agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Not installed yet
  Idle,
  /// Precaching the manifest
  Installing,
  /// Installed, waiting to take over
  Waiting,
  /// Purging stale generations and claiming clients
  Activating,
  /// Serving all events
  Active,
  /// Install failed; the previously active version keeps serving
  Redundant,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Idle => "idle",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub version_tag: String,
  pub precached: usize,
  /// Take over without waiting for old clients to close
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub version_tag: String,
  pub purged: Vec<String>,
  pub claimed: usize,
}

pub struct LifecycleController<S: Store, T: Transport> {
  version_tag: String,
  manifest: Vec<Url>,
  cache: CacheManager<S, T>,
  clients: Arc<RwLock<Clients>>,
  state: Mutex<LifecycleState>,
}

impl<S: Store, T: Transport> LifecycleController<S, T> {
  /// Create the controller, resuming as active when the store already
  /// records this version as the active one.
  pub fn new(
    version_tag: &str,
    manifest: Vec<Url>,
    cache: CacheManager<S, T>,
    clients: Arc<RwLock<Clients>>,
  ) -> Result<Self> {
    let active = cache.store().active_version()?;
    let state = if active.as_deref() == Some(version_tag) {
      LifecycleState::Active
    } else {
      LifecycleState::Idle
    };

    Ok(Self {
      version_tag: version_tag.to_string(),
      manifest,
      cache,
      clients,
      state: Mutex::new(state),
    })
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  pub fn is_active(&self) -> bool {
    self.state() == LifecycleState::Active
  }

  /// Move from one of `from` to `to`, failing on any other current state.
  fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| AgentError::InvalidState(e.to_string()))?;
    if !from.contains(&*state) {
      return Err(AgentError::InvalidState(format!(
        "cannot move from {} to {}",
        *state, to
      )));
    }
    *state = to;
    Ok(())
  }

  fn set_state(&self, to: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      *state = to;
    }
  }

  /// Precache the manifest into this version's generation.
  ///
  /// On failure the controller becomes redundant and nothing is promoted;
  /// a later install attempt may retry.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(
      &[LifecycleState::Idle, LifecycleState::Redundant],
      LifecycleState::Installing,
    )?;
    info!(version = %self.version_tag, "installing");

    match self.cache.precache(&self.version_tag, &self.manifest).await {
      Ok(precached) => {
        self.set_state(LifecycleState::Waiting);
        info!(version = %self.version_tag, precached, "installed");
        Ok(InstallReport {
          version_tag: self.version_tag.clone(),
          precached,
          skip_waiting: true,
        })
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        error!(version = %self.version_tag, error = %e, "install failed");
        Err(e)
      }
    }
  }

  /// Purge stale generations, record this version as active and claim
  /// every open client.
  pub async fn activate(&self) -> Result<ActivationReport> {
    self.transition(&[LifecycleState::Waiting], LifecycleState::Activating)?;
    info!(version = %self.version_tag, "activating");

    let purged = match self.finish_activation() {
      Ok(purged) => purged,
      Err(e) => {
        self.set_state(LifecycleState::Waiting);
        error!(version = %self.version_tag, error = %e, "activation failed");
        return Err(e);
      }
    };

    // Immediate takeover: already-loaded pages switch to this version now.
    let claimed = self.clients.write().await.claim(&self.version_tag);
    self.set_state(LifecycleState::Active);
    info!(version = %self.version_tag, purged = purged.len(), claimed, "active");

    Ok(ActivationReport {
      version_tag: self.version_tag.clone(),
      purged,
      claimed,
    })
  }

  fn finish_activation(&self) -> Result<Vec<String>> {
    let purged = self.cache.purge_stale(&self.version_tag)?;
    self.cache.store().set_active_version(&self.version_tag)?;
    Ok(purged)
  }
}
