//! The agent: one method per host event, wiring every component to the
//! shared store and transport.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::cache::CacheManager;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::http::{Request, Response, ResponseSource, Transport};
use crate::intercept::{FetchInterceptor, FetchOutcome};
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleController, LifecycleState};
use crate::notify::{Client, Clients, Notification, NotificationDispatcher, NotificationTray};
use crate::store::{QueuedOperation, Store};
use crate::sync::{DrainReport, SyncQueue};
use crate::theme::ThemePreference;

/// Snapshot of the agent's durable and in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
  pub state: LifecycleState,
  pub version_tag: String,
  pub active_version: Option<String>,
  pub generations: Vec<String>,
  pub cached_entries: usize,
  pub pending_operations: usize,
}

pub struct Agent<S: Store, T: Transport> {
  config: AgentConfig,
  store: Arc<S>,
  cache: CacheManager<S, T>,
  lifecycle: LifecycleController<S, T>,
  interceptor: FetchInterceptor<S, T>,
  queue: SyncQueue<S, T>,
  notifications: NotificationDispatcher,
  tray: Arc<RwLock<NotificationTray>>,
  clients: Arc<RwLock<Clients>>,
}

impl<S: Store, T: Transport> Agent<S, T> {
  pub fn new(config: AgentConfig, store: Arc<S>, transport: Arc<T>) -> Result<Self> {
    let origin = config.origin_url()?;
    let manifest = config
      .manifest
      .iter()
      .map(|entry| config.resolve(entry))
      .collect::<Result<Vec<Url>>>()?;
    let target = config.resolve(&config.notification.target)?;

    let tray = Arc::new(RwLock::new(NotificationTray::default()));
    let clients = Arc::new(RwLock::new(Clients::new()));

    let cache = CacheManager::new(Arc::clone(&store), Arc::clone(&transport));
    let queue = SyncQueue::new(Arc::clone(&store), Arc::clone(&transport), &config.sync_tag);
    let lifecycle = LifecycleController::new(
      &config.version_tag,
      manifest,
      cache.clone(),
      Arc::clone(&clients),
    )?;
    let interceptor = FetchInterceptor::new(
      origin,
      &config.api_prefix,
      config.sync_routes.clone(),
      cache.clone(),
      queue.clone(),
      transport,
    );
    let notifications = NotificationDispatcher::new(
      config.notification.clone(),
      target,
      &config.version_tag,
      Arc::clone(&tray),
      Arc::clone(&clients),
    );

    Ok(Self {
      config,
      store,
      cache,
      lifecycle,
      interceptor,
      queue,
      notifications,
      tray,
      clients,
    })
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  pub async fn on_install(&self) -> Result<InstallReport> {
    self.lifecycle.install().await
  }

  pub async fn on_activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate().await
  }

  /// Install and, since install asks to skip waiting, activate right away.
  pub async fn install_and_activate(&self) -> Result<ActivationReport> {
    let installed = self.on_install().await?;
    debug!(skip_waiting = installed.skip_waiting, "install complete");
    self.on_activate().await
  }

  /// Generation serving clients: this version's once active, otherwise
  /// the last version recorded active. `None` before any activation.
  fn serving_generation(&self) -> Result<Option<String>> {
    if self.lifecycle.is_active() {
      return Ok(Some(self.config.version_tag.clone()));
    }
    self.store.active_version()
  }

  /// Intercept a client request. While this version is installing or
  /// waiting, the previously active version keeps serving; requests pass
  /// through only when no version was ever activated.
  pub async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    match self.serving_generation()? {
      Some(generation) => self.interceptor.handle(request, &generation).await,
      None => Ok(FetchOutcome::Passthrough),
    }
  }

  /// Read the serving generation without touching the network.
  pub fn cached(&self, request: &Request) -> Result<Response> {
    let identity = request.identity();
    let generation = self
      .serving_generation()?
      .ok_or_else(|| AgentError::CacheMiss(identity.to_string()))?;
    self
      .cache
      .get(&generation, &identity)?
      .map(|entry| entry.to_response(ResponseSource::Cache))
      .ok_or_else(|| AgentError::CacheMiss(identity.to_string()))
  }

  pub async fn on_sync(&self, tag: &str) -> DrainReport {
    self.queue.drain(tag).await
  }

  pub async fn on_push(&self, payload: Option<&[u8]>) -> Notification {
    self.notifications.on_push(payload).await
  }

  pub async fn on_notification_click(&self, tag: &str) -> Result<Client> {
    self.notifications.on_notification_click(tag).await
  }

  pub fn pending(&self) -> Result<Vec<QueuedOperation>> {
    self.queue.pending()
  }

  pub fn clients(&self) -> &Arc<RwLock<Clients>> {
    &self.clients
  }

  pub fn tray(&self) -> &Arc<RwLock<NotificationTray>> {
    &self.tray
  }

  pub fn theme(&self) -> ThemePreference<S> {
    ThemePreference::new(Arc::clone(&self.store))
  }

  pub fn status(&self) -> Result<AgentStatus> {
    Ok(AgentStatus {
      state: self.lifecycle.state(),
      version_tag: self.config.version_tag.clone(),
      active_version: self.store.active_version()?,
      generations: self.store.generations()?,
      cached_entries: self.store.entries(&self.config.version_tag)?.len(),
      pending_operations: self.store.pending()?.len(),
    })
  }
}
