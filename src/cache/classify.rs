//! Request classification into resource classes.

use reqwest::Method;
use std::collections::HashSet;
use url::Url;

use super::http::Request;

/// Category of request, which decides the caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  /// Enumerated bootstrap assets: cache-first
  Static,
  /// Allow-listed API calls: network-first
  Api,
  /// Any other same-origin request: stale-while-revalidate
  Dynamic,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 3] = [Self::Static, Self::Api, Self::Dynamic];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Api => "api",
      Self::Dynamic => "dynamic",
    }
  }
}

/// How the cache should handle a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Forward to the transport untouched
  Passthrough,
  /// Handle with the strategy for this class
  Cached(ResourceClass),
}

/// Decides which resource class a request belongs to.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  static_paths: HashSet<String>,
  api_prefixes: Vec<String>,
  api_hosts: HashSet<String>,
}

impl Classifier {
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      static_paths: HashSet::new(),
      api_prefixes: Vec::new(),
      api_hosts: HashSet::new(),
    }
  }

  pub fn with_static_resources<I, P>(mut self, paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    self.static_paths.extend(paths.into_iter().map(Into::into));
    self
  }

  pub fn with_api_prefixes<I, P>(mut self, prefixes: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    self.api_prefixes.extend(prefixes.into_iter().map(Into::into));
    self
  }

  pub fn with_api_hosts<I, H>(mut self, hosts: I) -> Self
  where
    I: IntoIterator<Item = H>,
    H: Into<String>,
  {
    self
      .api_hosts
      .extend(hosts.into_iter().map(|h| h.into().to_lowercase()));
    self
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Absolute URLs of the bootstrap resource set, sorted for stable ordering.
  pub fn static_urls(&self) -> Vec<Url> {
    let mut paths: Vec<&String> = self.static_paths.iter().collect();
    paths.sort();
    paths
      .into_iter()
      .filter_map(|path| self.origin.join(path).ok())
      .collect()
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Passthrough;
    }

    let url = &request.url;
    let api_host = url
      .host_str()
      .map(|host| self.api_hosts.contains(&host.to_lowercase()))
      .unwrap_or(false);

    if api_host {
      return Route::Cached(ResourceClass::Api);
    }

    if url.origin() != self.origin.origin() {
      return Route::Passthrough;
    }

    let path = url.path();
    if self.static_paths.contains(path) {
      Route::Cached(ResourceClass::Static)
    } else if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      Route::Cached(ResourceClass::Api)
    } else {
      Route::Cached(ResourceClass::Dynamic)
    }
  }
}
