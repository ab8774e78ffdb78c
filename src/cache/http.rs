//! Request/response values seen by the cache and the transport seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An outbound read request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Parse `url` and build a GET request for it.
  pub fn parse_get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Stable cache key for this request: method plus URL without fragment.
  pub fn fingerprint(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as delivered to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Placeholder returned when nothing is cached and the network is unreachable.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  /// Only 2xx responses are eligible for caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Performs the actual network fetch behind the cache.
///
/// An `Err` means the request never produced a response (DNS, connect, timeout).
/// HTTP error statuses are returned as `Ok` responses.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fingerprint_ignores_fragment() {
    let a = Request::parse_get("https://app.example/api/markets?page=2#top").unwrap();
    let b = Request::parse_get("https://app.example/api/markets?page=2").unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
  }

  #[test]
  fn test_fingerprint_distinguishes_method_and_query() {
    let get = Request::parse_get("https://app.example/api/markets?page=1").unwrap();
    let other_page = Request::parse_get("https://app.example/api/markets?page=2").unwrap();
    let head = Request::new(Method::HEAD, get.url.clone());

    assert_ne!(get.fingerprint(), other_page.fingerprint());
    assert_ne!(get.fingerprint(), head.fingerprint());
    assert_eq!(get.fingerprint().len(), 64);
  }

  #[test]
  fn test_offline_placeholder() {
    let response = Response::offline();
    assert_eq!(response.status, 503);
    assert!(!response.is_success());
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.text(), "Offline");
  }
}
