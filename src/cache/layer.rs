//! Versioned response cache that sits in front of every outbound read.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::classify::{Classifier, ResourceClass, Route};
use super::http::{Request, Response, Transport};
use super::namespace::{CacheVersions, Namespace};
use super::traits::CacheResult;
use crate::store::Store;

/// Cache layer that applies one strategy per resource class.
///
/// - static: cache-first
/// - api: network-first, falling back to any cached entry
/// - dynamic: stale-while-revalidate
///
/// Store failures are returned as errors. Network failures never are; they
/// resolve to a cached entry or the offline placeholder.
pub struct ResponseCache<S: Store, T: Transport> {
  storage: Arc<S>,
  transport: Arc<T>,
  classifier: Arc<Classifier>,
  /// Held shared around each store write, exclusively while purging retired
  /// namespaces. Never held across a fetch.
  versions: Arc<RwLock<CacheVersions>>,
  /// How long an API response is considered fresh
  api_freshness: Duration,
}

impl<S, T> ResponseCache<S, T>
where
  S: Store + 'static,
  T: Transport + 'static,
{
  /// Create a cache and activate `versions`, purging every other namespace.
  pub fn new(
    storage: Arc<S>,
    transport: Arc<T>,
    classifier: Classifier,
    versions: CacheVersions,
  ) -> Result<Self> {
    let purged = storage.retain_namespaces(&versions.namespaces())?;
    if purged > 0 {
      info!(purged, "purged entries from retired cache namespaces");
    }

    Ok(Self {
      storage,
      transport,
      classifier: Arc::new(classifier),
      versions: Arc::new(RwLock::new(versions)),
      api_freshness: Duration::minutes(5),
    })
  }

  /// Set the freshness window for API responses.
  pub fn with_api_freshness(mut self, api_freshness: Duration) -> Self {
    self.api_freshness = api_freshness;
    self
  }

  pub fn classifier(&self) -> &Classifier {
    &self.classifier
  }

  pub async fn active_versions(&self) -> CacheVersions {
    self.versions.read().await.clone()
  }

  /// Switch to a new version tuple.
  ///
  /// Retired namespaces are purged before any further request is served.
  /// Returns the number of entries removed.
  pub async fn activate(&self, versions: CacheVersions) -> Result<usize> {
    let mut active = self.versions.write().await;
    let purged = self.storage.retain_namespaces(&versions.namespaces())?;
    info!(
      purged,
      static_version = %versions.static_assets,
      api_version = %versions.api,
      dynamic_version = %versions.dynamic,
      "activated cache versions"
    );
    *active = versions;
    Ok(purged)
  }

  /// Serve a request through the cache.
  pub async fn intercept(&self, request: &Request) -> Result<CacheResult<Response>> {
    let class = match self.classifier.classify(request) {
      Route::Passthrough => {
        let response = self.transport.fetch(request).await?;
        return Ok(CacheResult::passthrough(response));
      }
      Route::Cached(class) => class,
    };

    let namespace = self.versions.read().await.namespace(class);

    match class {
      ResourceClass::Static => self.cache_first(&namespace, request).await,
      ResourceClass::Api => self.network_first(&namespace, request).await,
      ResourceClass::Dynamic => self.stale_while_revalidate(&namespace, request).await,
    }
  }

  /// Fetch and store every static resource. Returns how many were cached.
  pub async fn precache(&self) -> Result<usize> {
    let namespace = self.versions.read().await.namespace(ResourceClass::Static);

    let mut cached = 0;
    for url in self.classifier.static_urls() {
      let request = Request::get(url);
      match self.transport.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.store(&namespace, &request, &response).await?;
          cached += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "skipping static resource");
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "failed to precache static resource");
        }
      }
    }

    Ok(cached)
  }

  /// Number of entries in the active namespace of `class`.
  pub async fn entry_count(&self, class: ResourceClass) -> Result<usize> {
    let namespace = self.versions.read().await.namespace(class);
    self.storage.count_responses(&namespace.name())
  }

  async fn cache_first(
    &self,
    namespace: &Namespace,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    if let Some(cached) = self
      .storage
      .get_response(&namespace.name(), &request.fingerprint())?
    {
      debug!(url = %request.url, "static cache hit");
      return Ok(CacheResult::from_cache(
        cached.response,
        cached.inserted_at,
        false,
      ));
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        self.store(namespace, request, &response).await?;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "static fetch failed with empty cache");
        Ok(CacheResult::placeholder())
      }
    }
  }

  async fn network_first(
    &self,
    namespace: &Namespace,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    match self.transport.fetch(request).await {
      Ok(response) => {
        self.store(namespace, request, &response).await?;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "api fetch failed, trying cache");
        // Serve stale over nothing, whatever the age.
        match self
          .storage
          .get_response(&namespace.name(), &request.fingerprint())?
        {
          Some(cached) => {
            let stale = self.is_stale(cached.inserted_at);
            Ok(CacheResult::from_cache(
              cached.response,
              cached.inserted_at,
              stale,
            ))
          }
          None => Ok(CacheResult::placeholder()),
        }
      }
    }
  }

  async fn stale_while_revalidate(
    &self,
    namespace: &Namespace,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    if let Some(cached) = self
      .storage
      .get_response(&namespace.name(), &request.fingerprint())?
    {
      self.spawn_revalidation(namespace.clone(), request.clone());
      let stale = self.is_stale(cached.inserted_at);
      return Ok(CacheResult::from_cache(
        cached.response,
        cached.inserted_at,
        stale,
      ));
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        self.store(namespace, request, &response).await?;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "dynamic fetch failed with empty cache");
        Ok(CacheResult::placeholder())
      }
    }
  }

  /// Refresh an entry in a detached task.
  ///
  /// The caller already has its answer, so failures are only logged. The result
  /// is dropped if the namespace was retired while the fetch was in flight.
  fn spawn_revalidation(&self, namespace: Namespace, request: Request) {
    let this = self.clone();

    tokio::spawn(async move {
      let response = match this.transport.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
          debug!(url = %request.url, error = %e, "background revalidation failed");
          return;
        }
      };

      if let Err(e) = this.store(&namespace, &request, &response).await {
        warn!(url = %request.url, error = %e, "failed to store revalidated response");
      }
    });
  }

  /// Store `response` if it is cacheable and `namespace` is still active.
  /// The caller keeps its own copy either way.
  async fn store(
    &self,
    namespace: &Namespace,
    request: &Request,
    response: &Response,
  ) -> Result<()> {
    if !response.is_success() {
      debug!(url = %request.url, status = response.status, "response not cacheable");
      return Ok(());
    }

    // Held until the write lands so a concurrent purge cannot miss it
    let active = self.versions.read().await;
    if active.namespace(namespace.class) != *namespace {
      debug!(namespace = %namespace.name(), "namespace retired during fetch");
      return Ok(());
    }

    self.storage.put_response(
      &namespace.name(),
      &request.fingerprint(),
      request.url.as_str(),
      response,
      Utc::now(),
    )
  }

  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.api_freshness
  }
}

impl<S: Store, T: Transport> Clone for ResponseCache<S, T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: Arc::clone(&self.transport),
      classifier: Arc::clone(&self.classifier),
      versions: Arc::clone(&self.versions),
      api_freshness: self.api_freshness,
    }
  }
}
