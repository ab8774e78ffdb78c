//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for domain entities that can be snapshotted into the cache.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity within its type (e.g. market id)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g. "market", "position")
  fn entity_type() -> &'static str;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a result for a request the cache does not handle.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }

  /// Whether the data was served from the cache rather than the network.
  pub fn is_cached(&self) -> bool {
    matches!(self.source, CacheSource::CacheFresh | CacheSource::CacheStale)
  }
}

impl CacheResult<super::Response> {
  /// Nothing cached and the network is unreachable.
  pub fn placeholder() -> Self {
    Self {
      data: super::Response::offline(),
      source: CacheSource::Placeholder,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, older than the freshness window
  CacheStale,
  /// Network unavailable and nothing cached
  Placeholder,
  /// Not handled by the cache (cross-origin or non-GET)
  Passthrough,
}
