use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::http::{Request, Transport};
use crate::intercept::FetchOutcome;
use crate::lifecycle::{ActivationReport, InstallReport};
use crate::notify::{Client, Notification};
use crate::store::Store;
use crate::sync::DrainReport;

/// Host events delivered to the agent
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  /// Sync trigger carrying its tag
  Sync(String),
  /// Push message with optional payload
  Push(Option<Vec<u8>>),
  /// Click on the notification with this tag
  NotificationClick(String),
}

impl Event {
  fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch(_) => "fetch",
      Self::Sync(_) => "sync",
      Self::Push(_) => "push",
      Self::NotificationClick(_) => "notificationclick",
    }
  }
}

/// What a handler produced once its work completed
#[derive(Debug)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivationReport),
  Fetched(FetchOutcome),
  Synced(DrainReport),
  Pushed(Notification),
  Clicked(Client),
}

struct Envelope {
  event: Event,
  done: oneshot::Sender<Result<Outcome>>,
}

/// Host side: delivers events and waits until their work is finished
#[derive(Clone)]
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventHandler {
  /// Deliver an event and wait for its handler to resolve.
  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    let (done, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, done })
      .map_err(|_| AgentError::InvalidState("event loop stopped".into()))?;
    rx.await
      .map_err(|_| AgentError::InvalidState("event handler dropped".into()))?
  }
}

/// Agent side: runs one task per event so handlers interleave at await points
pub struct EventLoop<S: Store, T: Transport> {
  agent: Arc<Agent<S, T>>,
  rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create a connected handler/loop pair for `agent`.
pub fn channel<S: Store, T: Transport>(agent: Arc<Agent<S, T>>) -> (EventHandler, EventLoop<S, T>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (EventHandler { tx }, EventLoop { agent, rx })
}

impl<S: Store, T: Transport> EventLoop<S, T> {
  /// Run until every handler is dropped and all outstanding work is done.
  pub async fn run(mut self) {
    let mut outstanding = JoinSet::new();

    loop {
      tokio::select! {
        Some(envelope) = self.rx.recv() => {
          let agent = Arc::clone(&self.agent);
          outstanding.spawn(async move {
            let name = envelope.event.name();
            let result = handle(&agent, envelope.event).await;
            debug!(event = name, ok = result.is_ok(), "event resolved");
            if envelope.done.send(result).is_err() {
              warn!(event = name, "event resolved after host stopped waiting");
            }
          });
        }
        Some(_) = outstanding.join_next(), if !outstanding.is_empty() => {}
        else => break,
      }
    }
  }
}

async fn handle<S: Store, T: Transport>(agent: &Agent<S, T>, event: Event) -> Result<Outcome> {
  match event {
    Event::Install => agent.on_install().await.map(Outcome::Installed),
    Event::Activate => agent.on_activate().await.map(Outcome::Activated),
    Event::Fetch(request) => agent.on_fetch(&request).await.map(Outcome::Fetched),
    Event::Sync(tag) => Ok(Outcome::Synced(agent.on_sync(&tag).await)),
    Event::Push(payload) => Ok(Outcome::Pushed(agent.on_push(payload.as_deref()).await)),
    Event::NotificationClick(tag) => agent.on_notification_click(&tag).await.map(Outcome::Clicked),
  }
}
