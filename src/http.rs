//! Request/response model and the network transport seam.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::error::{AgentError, Result};

pub type Headers = BTreeMap<String, String>;

/// How the client issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Sub-resource or script-initiated request
  #[default]
  Other,
}

/// An outgoing client request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Headers::new(),
      body: None,
      mode: RequestMode::Other,
    }
  }

  /// Parse `url` and build a GET request.
  pub fn get(url: &str) -> Result<Self> {
    Ok(Self::new("GET", parse_url(url)?))
  }

  /// Parse `url` and build a top-level navigation request.
  pub fn navigate(url: &str) -> Result<Self> {
    let mut request = Self::get(url)?;
    request.mode = RequestMode::Navigate;
    Ok(request)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Requests that change server state and are never cached.
  pub fn is_mutating(&self) -> bool {
    !matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(&self.method, &self.url)
  }
}

/// Cache identity of a request: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  pub fn new(method: &str, url: &Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.as_str().to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Stable fixed-length storage key.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Where a response handed to the client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  /// Cached entry for the same request identity
  Cache,
  /// Cached root page served for an uncached navigation
  OfflineFallback,
  /// Synthesized after queueing a failed mutating request
  Queued,
}

/// A response, either live from the network or captured in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Network seam. Implementations report transport failures as
/// [`AgentError::Network`] and every HTTP status as `Ok`.
pub trait Transport: Send + Sync + 'static {
  fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| AgentError::Network(format!("failed to build http client: {}", e)))?;
    Ok(Self { client })
  }
}

impl Transport for ReqwestTransport {
  fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let client = self.client.clone();
    let request = request.clone();

    async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| AgentError::Network(format!("invalid method {}: {}", request.method, e)))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| AgentError::Network(e.to_string()))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| AgentError::Network(e.to_string()))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
        source: ResponseSource::Network,
      })
    }
  }
}

pub fn parse_url(url: &str) -> Result<Url> {
  Url::parse(url).map_err(|e| AgentError::InvalidUrl {
    url: url.to_string(),
    reason: e.to_string(),
  })
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identity_key_depends_on_method_and_url() {
    let url = parse_url("https://app.test/css/output.css").unwrap();
    let get = RequestIdentity::get(&url);
    let post = RequestIdentity::new("post", &url);

    assert_eq!(get.cache_key().len(), 64);
    assert_eq!(get.cache_key(), RequestIdentity::get(&url).cache_key());
    assert_ne!(get.cache_key(), post.cache_key());
    assert_eq!(post.to_string(), "POST https://app.test/css/output.css");
  }

  #[test]
  fn only_safe_methods_are_non_mutating() {
    let url = parse_url("https://app.test/user/prayers").unwrap();
    assert!(!Request::new("get", url.clone()).is_mutating());
    assert!(!Request::new("HEAD", url.clone()).is_mutating());
    assert!(Request::new("POST", url.clone()).is_mutating());
    assert!(Request::new("delete", url).is_mutating());
  }

  #[test]
  fn navigate_sets_mode() {
    let request = Request::navigate("https://app.test/user/dashboard").unwrap();
    assert!(request.is_navigation());
    assert!(!Request::get("https://app.test/").unwrap().is_navigation());
  }

  #[test]
  fn relative_urls_are_rejected() {
    assert!(matches!(
      Request::get("/css/output.css"),
      Err(AgentError::InvalidUrl { .. })
    ));
  }

  #[test]
  fn http_error_statuses_are_not_success() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(404, "").is_success());
    assert!(!Response::new(503, "").is_success());
  }
}
