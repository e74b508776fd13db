use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub agent: AgentConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

/// Everything the agent core needs to know about the deployed client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  /// Cache generation tag of this deployment
  pub version_tag: String,
  /// The agent's own origin; requests elsewhere pass through untouched
  pub origin: String,
  /// URLs precached on install, relative to `origin` or absolute
  pub manifest: Vec<String>,
  /// Path segment marking live data that is never cached
  pub api_prefix: String,
  /// Sync trigger tag that drains the queue
  pub sync_tag: String,
  /// Path prefixes whose failed mutating requests are queued for replay
  #[serde(deserialize_with = "deserialize_routes")]
  pub sync_routes: Vec<String>,
  pub notification: NotificationConfig,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      version_tag: "amaliah-ramadhan-v1".to_string(),
      origin: "http://localhost:8080".to_string(),
      manifest: vec![
        "/".to_string(),
        "/css/output.css".to_string(),
        "/images/logoniba.png".to_string(),
        "/images/icon-192x192.png".to_string(),
        "/images/icon-512x512.png".to_string(),
        "https://fonts.googleapis.com/css2?family=Amiri:wght@400;700&family=Cairo:wght@400;500;600;700&display=swap".to_string(),
      ],
      api_prefix: "/api/".to_string(),
      sync_tag: "sync-prayers".to_string(),
      sync_routes: vec![
        "/user/prayers".to_string(),
        "/user/fasting".to_string(),
        "/user/quran".to_string(),
        "/user/amaliah".to_string(),
      ],
      notification: NotificationConfig::default(),
    }
  }
}

impl AgentConfig {
  /// Parsed origin URL.
  pub fn origin_url(&self) -> crate::error::Result<Url> {
    crate::http::parse_url(&self.origin)
  }

  /// Resolve a manifest or route path against the origin.
  pub fn resolve(&self, path: &str) -> crate::error::Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| crate::error::AgentError::InvalidUrl {
        url: path.to_string(),
        reason: e.to_string(),
      })
  }

  /// Reject configurations the agent cannot serve offline with.
  pub fn validate(&self) -> Result<()> {
    if self.version_tag.trim().is_empty() {
      return Err(eyre!("agent.version_tag must not be empty"));
    }

    let origin = Url::parse(&self.origin)
      .map_err(|e| eyre!("agent.origin '{}' is not a valid URL: {}", self.origin, e))?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("agent.origin must be an http(s) URL, got {}", self.origin));
    }

    if !self.manifest.iter().any(|u| u == "/") {
      return Err(eyre!(
        "agent.manifest must include the root URL '/' for the offline fallback page"
      ));
    }

    for entry in &self.manifest {
      self
        .resolve(entry)
        .map_err(|e| eyre!("agent.manifest entry '{}' is invalid: {}", entry, e))?;
    }

    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  /// Notifications sharing this tag replace each other
  pub tag: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Body used when a push carries no payload
  pub default_body: String,
  /// Client route focused or opened on click
  pub target: String,
  pub require_interaction: bool,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Amaliah Ramadhan".to_string(),
      tag: "amaliah-reminder".to_string(),
      icon: "/images/icon-192x192.png".to_string(),
      badge: "/images/icon-72x72.png".to_string(),
      vibrate: vec![200, 100, 200],
      default_body: "Jangan lupa isi amaliah hari ini!".to_string(),
      target: "/user/dashboard".to_string(),
      require_interaction: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Transport timeout; the agent itself never cancels requests
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Also write a daily rolling log file in the data directory
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
    }
  }
}

fn deserialize_routes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| {
        let s = s.trim();
        if s.starts_with('/') {
          s.to_string()
        } else {
          format!("/{}", s)
        }
      })
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-agent/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.agent.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Resolve the database path.
  ///
  /// Checks OFFLINE_AGENT_DB first, then `storage.path`, then the data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Ok(path) = std::env::var("OFFLINE_AGENT_DB") {
      return Ok(PathBuf::from(path));
    }
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }
    crate::store::SqliteStore::default_path()
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }
}
