//! Read-path caching.
//!
//! This module provides:
//! - A versioned response cache that classifies requests and applies cache-first,
//!   network-first or stale-while-revalidate per resource class
//! - Atomic invalidation by bumping a class's namespace version
//! - A snapshot cache for domain objects with age-based eviction
//! - Basic offline mode (serve stale cache when network unavailable)

mod classify;
mod http;
mod layer;
mod namespace;
mod snapshot;
mod traits;

pub use classify::{Classifier, ResourceClass, Route};
pub use http::{Request, Response, Transport};
pub use layer::ResponseCache;
pub use namespace::{CacheVersions, Namespace};
pub use snapshot::{CachedSnapshot, SnapshotCache};
pub use traits::{CacheResult, CacheSource, Cacheable};
