//! Push notifications and the client contexts they route back into.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::NotificationConfig;
use crate::error::{AgentError, Result};

/// A notification as presented to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub tag: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub require_interaction: bool,
  pub shown_at: DateTime<Utc>,
}

/// Visible notifications, at most one per tag.
#[derive(Debug, Default)]
pub struct NotificationTray {
  visible: BTreeMap<String, Notification>,
}

impl NotificationTray {
  /// Show a notification, replacing any with the same tag.
  pub fn show(&mut self, notification: Notification) -> Option<Notification> {
    self.visible.insert(notification.tag.clone(), notification)
  }

  pub fn close(&mut self, tag: &str) -> Option<Notification> {
    self.visible.remove(tag)
  }

  #[cfg(test)]
  pub fn get(&self, tag: &str) -> Option<&Notification> {
    self.visible.get(tag)
  }

  pub fn visible(&self) -> Vec<&Notification> {
    self.visible.values().collect()
  }
}

/// An open client context (window) of the web app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: String,
  pub url: Url,
  pub focused: bool,
  /// Version tag of the agent instance controlling this client
  pub controller: Option<String>,
}

/// Registry of open client contexts.
#[derive(Debug, Default)]
pub struct Clients {
  clients: BTreeMap<String, Client>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an already-open, uncontrolled client.
  pub fn add(&mut self, url: Url) -> Client {
    let client = Client {
      id: next_client_id(),
      url,
      focused: false,
      controller: None,
    };
    self.clients.insert(client.id.clone(), client.clone());
    client
  }

  #[cfg(test)]
  pub fn get(&self, id: &str) -> Option<&Client> {
    self.clients.get(id)
  }

  #[cfg(test)]
  pub fn all(&self) -> Vec<&Client> {
    self.clients.values().collect()
  }

  /// Take control of every open client. Returns how many changed controller.
  pub fn claim(&mut self, version_tag: &str) -> usize {
    let mut claimed = 0;
    for client in self.clients.values_mut() {
      if client.controller.as_deref() != Some(version_tag) {
        client.controller = Some(version_tag.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  /// Focus `id`, unfocusing every other client.
  pub fn focus(&mut self, id: &str) -> Result<Client> {
    if !self.clients.contains_key(id) {
      return Err(AgentError::InvalidState(format!("no client {}", id)));
    }
    for client in self.clients.values_mut() {
      client.focused = client.id == id;
    }
    self
      .clients
      .get(id)
      .cloned()
      .ok_or_else(|| AgentError::InvalidState(format!("no client {}", id)))
  }

  /// Open and focus a new client at `url`.
  pub fn open_window(&mut self, url: Url, controller: Option<&str>) -> Client {
    for client in self.clients.values_mut() {
      client.focused = false;
    }
    let client = Client {
      id: next_client_id(),
      url,
      focused: true,
      controller: controller.map(String::from),
    };
    self.clients.insert(client.id.clone(), client.clone());
    client
  }

  fn find_by_url(&self, url: &Url) -> Option<&Client> {
    self.clients.values().find(|c| &c.url == url)
  }
}

fn next_client_id() -> String {
  static COUNTER: AtomicU64 = AtomicU64::new(1);
  format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Presents push messages and routes clicks back into the client.
pub struct NotificationDispatcher {
  config: NotificationConfig,
  target: Url,
  version_tag: String,
  tray: Arc<RwLock<NotificationTray>>,
  clients: Arc<RwLock<Clients>>,
}

impl NotificationDispatcher {
  pub fn new(
    config: NotificationConfig,
    target: Url,
    version_tag: &str,
    tray: Arc<RwLock<NotificationTray>>,
    clients: Arc<RwLock<Clients>>,
  ) -> Self {
    Self {
      config,
      target,
      version_tag: version_tag.to_string(),
      tray,
      clients,
    }
  }

  /// Show a notification for a push message. An absent or empty payload
  /// shows the default reminder.
  pub async fn on_push(&self, payload: Option<&[u8]>) -> Notification {
    let body = match payload {
      Some(bytes) if !bytes.is_empty() => String::from_utf8_lossy(bytes).into_owned(),
      _ => self.config.default_body.clone(),
    };

    let notification = Notification {
      title: self.config.title.clone(),
      body,
      tag: self.config.tag.clone(),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: self.config.vibrate.clone(),
      require_interaction: self.config.require_interaction,
      shown_at: Utc::now(),
    };

    let replaced = self.tray.write().await.show(notification.clone());
    info!(tag = %notification.tag, replaced = replaced.is_some(), "push notification shown");
    notification
  }

  /// Close the clicked notification and focus the target view, opening it
  /// when no client shows it yet.
  pub async fn on_notification_click(&self, tag: &str) -> Result<Client> {
    self.tray.write().await.close(tag);

    let mut clients = self.clients.write().await;
    let existing = clients.find_by_url(&self.target).map(|c| c.id.clone());
    let client = match existing {
      Some(id) => clients.focus(&id)?,
      None => clients.open_window(self.target.clone(), Some(&self.version_tag)),
    };
    debug!(client = %client.id, url = %client.url, "notification click routed");
    Ok(client)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::parse_url;

  fn dispatcher() -> (
    NotificationDispatcher,
    Arc<RwLock<NotificationTray>>,
    Arc<RwLock<Clients>>,
  ) {
    let tray = Arc::new(RwLock::new(NotificationTray::default()));
    let clients = Arc::new(RwLock::new(Clients::new()));
    let dispatcher = NotificationDispatcher::new(
      NotificationConfig::default(),
      parse_url("https://app.test/user/dashboard").unwrap(),
      "v1",
      Arc::clone(&tray),
      Arc::clone(&clients),
    );
    (dispatcher, tray, clients)
  }

  #[tokio::test]
  async fn push_uses_payload_text() {
    let (dispatcher, _, _) = dispatcher();
    let shown = dispatcher.on_push(Some("Waktunya sahur".as_bytes())).await;

    assert_eq!(shown.body, "Waktunya sahur");
    assert_eq!(shown.title, "Amaliah Ramadhan");
    assert_eq!(shown.tag, "amaliah-reminder");
    assert_eq!(shown.vibrate, vec![200, 100, 200]);
    assert!(!shown.require_interaction);
  }

  #[tokio::test]
  async fn absent_payload_uses_default_message() {
    let (dispatcher, _, _) = dispatcher();
    assert_eq!(
      dispatcher.on_push(None).await.body,
      "Jangan lupa isi amaliah hari ini!"
    );
    assert_eq!(
      dispatcher.on_push(Some(b"")).await.body,
      "Jangan lupa isi amaliah hari ini!"
    );
  }

  #[tokio::test]
  async fn same_tag_replaces_previous_notification() {
    let (dispatcher, tray, _) = dispatcher();
    dispatcher.on_push(Some(b"first")).await;
    dispatcher.on_push(Some(b"second")).await;

    let tray = tray.read().await;
    let visible = tray.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].body, "second");
  }

  #[tokio::test]
  async fn click_closes_and_opens_target() {
    let (dispatcher, tray, clients) = dispatcher();
    dispatcher.on_push(None).await;

    let client = dispatcher
      .on_notification_click("amaliah-reminder")
      .await
      .unwrap();

    assert!(tray.read().await.visible().is_empty());
    assert_eq!(client.url.as_str(), "https://app.test/user/dashboard");
    assert!(client.focused);
    assert_eq!(clients.read().await.all().len(), 1);
  }

  #[tokio::test]
  async fn click_focuses_existing_target_client() {
    let (dispatcher, _, clients) = dispatcher();
    let other = clients
      .write()
      .await
      .open_window(parse_url("https://app.test/jadwal").unwrap(), None);
    let existing = clients
      .write()
      .await
      .add(parse_url("https://app.test/user/dashboard").unwrap());

    let client = dispatcher
      .on_notification_click("amaliah-reminder")
      .await
      .unwrap();

    assert_eq!(client.id, existing.id);
    let clients = clients.read().await;
    assert_eq!(clients.all().len(), 2);
    assert!(!clients.get(&other.id).unwrap().focused);
  }

  #[test]
  fn claim_sets_controller_once() {
    let mut clients = Clients::new();
    clients.add(parse_url("https://app.test/").unwrap());
    clients.add(parse_url("https://app.test/jadwal").unwrap());

    assert_eq!(clients.claim("v2"), 2);
    assert_eq!(clients.claim("v2"), 0);
    assert!(clients
      .all()
      .iter()
      .all(|c| c.controller.as_deref() == Some("v2")));
  }
}
