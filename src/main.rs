mod agent;
mod cache;
mod config;
mod error;
mod event;
mod http;
mod intercept;
mod lifecycle;
mod logging;
mod notify;
mod store;
mod sync;
mod theme;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent::Agent;
use event::{Event, EventHandler, Outcome};
use http::{parse_url, ReqwestTransport, Request, Response, Transport};
use intercept::FetchOutcome;
use store::{SqliteStore, Store};

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "Offline cache and deferred sync agent for web clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest for the configured version and take over
  Install {
    /// Stop after install, leaving the previous version active
    #[arg(long)]
    no_activate: bool,
  },
  /// Send a request through the agent
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Request body
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as "name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Only read the current cache generation
    #[arg(long)]
    cached: bool,
  },
  /// Replay queued operations
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// List queued operations
  Queue,
  /// Show a push notification
  Push {
    message: Option<String>,
    /// Click the notification right away
    #[arg(long)]
    open: bool,
  },
  /// Show lifecycle and storage state
  Status,
  /// Show or toggle the persisted theme
  Theme {
    #[arg(value_enum, default_value_t = ThemeAction::Show)]
    action: ThemeAction,
    /// Whether the system prefers a dark color scheme
    #[arg(long)]
    system_dark: bool,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ThemeAction {
  Show,
  Toggle,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;
  let _log_guard = logging::init(&config.logging, db_path.parent())?;

  let store = Arc::new(SqliteStore::open(&db_path)?);
  let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(
    config.network.timeout_secs,
  ))?);
  let agent = Arc::new(Agent::new(config.agent, store, Arc::clone(&transport))?);

  // The loop keeps running until every dispatched event has resolved.
  let (handler, event_loop) = event::channel(Arc::clone(&agent));
  let running = tokio::spawn(event_loop.run());

  let result = run(args.command, &agent, &handler, transport.as_ref()).await;

  drop(handler);
  running.await?;
  result
}

async fn run<S: Store, T: Transport>(
  command: Command,
  agent: &Agent<S, T>,
  handler: &EventHandler,
  transport: &T,
) -> Result<()> {
  match command {
    Command::Install { no_activate } => {
      let Outcome::Installed(installed) = handler.dispatch(Event::Install).await? else {
        return Err(eyre!("unexpected install outcome"));
      };
      println!("installed {} ({} entries)", installed.version_tag, installed.precached);

      if !no_activate && installed.skip_waiting {
        let Outcome::Activated(activated) = handler.dispatch(Event::Activate).await? else {
          return Err(eyre!("unexpected activate outcome"));
        };
        for tag in &activated.purged {
          println!("deleted stale generation {}", tag);
        }
        println!("active {}", activated.version_tag);
      }
    }

    Command::Fetch {
      url,
      method,
      navigate,
      body,
      headers,
      cached,
    } => {
      let mut request = Request::new(&method, parse_url(&url)?);
      if navigate {
        request.mode = http::RequestMode::Navigate;
        // A navigation opens a page the agent can later claim.
        agent.clients().write().await.add(request.url.clone());
      }
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header must look like 'name: value', got '{}'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(body) = body {
        request = request.with_body(body);
      }

      if cached {
        print_response(&agent.cached(&request)?);
        return Ok(());
      }

      let Outcome::Fetched(outcome) = handler.dispatch(Event::Fetch(request.clone())).await? else {
        return Err(eyre!("unexpected fetch outcome"));
      };
      let response = match outcome {
        FetchOutcome::Respond {
          response,
          cache_write,
        } => {
          if let Some(write) = cache_write {
            write.finished().await;
          }
          response
        }
        // Not intercepted: the host performs the request itself.
        FetchOutcome::Passthrough => transport.send(&request).await?,
      };
      print_response(&response);
    }

    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| agent.config().sync_tag.clone());
      let Outcome::Synced(report) = handler.dispatch(Event::Sync(tag)).await? else {
        return Err(eyre!("unexpected sync outcome"));
      };
      println!("succeeded: {}, failed: {}", report.succeeded, report.failed);
      for id in &report.failed_ids {
        println!("still queued: {}", id);
      }
    }

    Command::Queue => {
      for queued in agent.pending()? {
        println!(
          "{:>5}  {}  {} {}",
          queued.id,
          queued.queued_at.format("%Y-%m-%d %H:%M:%S"),
          queued.operation.method,
          queued.operation.url
        );
      }
    }

    Command::Push { message, open } => {
      let payload = message.map(String::into_bytes);
      let Outcome::Pushed(notification) = handler.dispatch(Event::Push(payload)).await? else {
        return Err(eyre!("unexpected push outcome"));
      };
      println!("[{}] {}: {}", notification.tag, notification.title, notification.body);

      if open {
        let click = Event::NotificationClick(notification.tag.clone());
        let Outcome::Clicked(client) = handler.dispatch(click).await? else {
          return Err(eyre!("unexpected click outcome"));
        };
        println!("focused {} ({})", client.url, client.id);
      }
      println!("visible: {}", agent.tray().read().await.visible().len());
    }

    Command::Status => {
      let status = agent.status()?;
      println!("version:    {}", status.version_tag);
      println!("state:      {}", status.state);
      println!(
        "active:     {}",
        status.active_version.as_deref().unwrap_or("none")
      );
      println!("generations: {}", status.generations.join(", "));
      println!("cached:     {}", status.cached_entries);
      println!("queued:     {}", status.pending_operations);
    }

    Command::Theme {
      action,
      system_dark,
    } => {
      let theme = agent.theme();
      let current = match action {
        ThemeAction::Show => theme.resolve(system_dark)?,
        ThemeAction::Toggle => theme.toggle(system_dark)?,
      };
      println!("{}", current);
    }
  }

  Ok(())
}

fn print_response(response: &Response) {
  println!("{} ({:?})", response.status, response.source);
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}
