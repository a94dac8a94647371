//! Outbound request/response model and the network seam.
//!
//! The cache layer never talks to the network directly; it goes through a
//! [`Fetcher`], which keeps strategies testable without sockets.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// What the request is for. Drives the offline fallback choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigation to a document
  Document,
  Image,
  Other,
}

/// An outbound request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: &str, url: Url, destination: Destination) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      destination,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url, Destination::Other)
  }

  pub fn navigate(url: Url) -> Self {
    Self::new("GET", url, Destination::Document)
  }

  pub fn image(url: Url) -> Self {
    Self::new("GET", url, Destination::Image)
  }

  /// Parse a URL string into a plain GET request.
  pub fn parse_get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }

  /// URL used for identity, with any fragment removed.
  pub fn identity_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length key identifying this request within a partition.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.identity_url());
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response, either from the network or out of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header names are stored lower-cased
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthesized 503 used when neither cache nor network can answer.
  pub fn unavailable(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self::new(503, body).with_header("content-type", content_type)
  }
}

/// Network-level failure. HTTP error statuses are not failures at this level.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Offline(String),

  #[error("request timed out")]
  Timeout,

  #[error("transport error: {0}")]
  Transport(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FetchError::Timeout
    } else if e.is_connect() {
      FetchError::Offline(e.to_string())
    } else {
      FetchError::Transport(e.to_string())
    }
  }
}

/// Issues requests to the remote backend.
///
/// The returned future is `'static` so it can be detached onto its own task
/// (stale-while-revalidate does this).
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response, FetchError>>;
}

/// [`Fetcher`] backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let client = self.client.clone();
    let method = request.method.clone();
    let url = request.url.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| FetchError::Transport(e.to_string()))?;

      let response = client.request(method, url).send().await?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await?.to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

/// Runtime online/offline signal. Only consulted to decide whether a
/// background revalidation is worth attempting.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
  pub fn online() -> Self {
    Self(Arc::new(AtomicBool::new(true)))
  }

  pub fn is_online(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }

  pub fn set_online(&self, online: bool) {
    self.0.store(online, Ordering::Relaxed);
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use parking_lot::Mutex;
  use std::collections::HashMap;
  use std::sync::atomic::AtomicUsize;

  /// Fake backend. Answers every URL with `200` and a body naming the URL and
  /// the per-URL call number, so fresh and cached bodies can be told apart.
  pub struct StubFetcher {
    online: AtomicBool,
    latency: Duration,
    calls: AtomicUsize,
    per_url: Mutex<HashMap<String, usize>>,
    statuses: Mutex<HashMap<String, u16>>,
  }

  impl StubFetcher {
    pub fn new() -> Self {
      Self {
        online: AtomicBool::new(true),
        latency: Duration::ZERO,
        calls: AtomicUsize::new(0),
        per_url: Mutex::new(HashMap::new()),
        statuses: Mutex::new(HashMap::new()),
      }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
      self.latency = latency;
      self
    }

    pub fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    /// Make a URL answer with a fixed status instead of `200`.
    pub fn respond_with(&self, url: &str, status: u16) {
      self.statuses.lock().insert(url.to_string(), status);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
      self.per_url.lock().get(url).copied().unwrap_or(0)
    }
  }

  impl Fetcher for StubFetcher {
    fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response, FetchError>> {
      let url = request.url.to_string();
      let online = self.online.load(Ordering::SeqCst);
      let latency = self.latency;

      let outcome = if online {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut per_url = self.per_url.lock();
        let count = per_url.entry(url.clone()).or_insert(0);
        *count += 1;
        let status = self.statuses.lock().get(&url).copied().unwrap_or(200);
        Ok(Response::new(status, format!("{} #{}", url, count)))
      } else {
        Err(FetchError::Offline(url))
      };

      Box::pin(async move {
        if !latency.is_zero() {
          tokio::time::sleep(latency).await;
        }
        outcome
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::parse_get("https://shop.test/products?page=2#top").unwrap();
    let b = Request::parse_get("https://shop.test/products?page=2").unwrap();
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_cache_key_depends_on_method() {
    let url = Url::parse("https://shop.test/api/cart").unwrap();
    let get = Request::get(url.clone());
    let post = Request::new("post", url, Destination::Other);
    assert!(post.method == "POST");
    assert_ne!(get.cache_key(), post.cache_key());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/plain"));
  }

  #[test]
  fn test_unavailable_is_not_success() {
    let response = Response::unavailable("text/plain", "offline");
    assert_eq!(response.status, 503);
    assert!(!response.is_success());
  }
}
