//! Domain snapshot cache (markets, positions) with age-based eviction.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::Cacheable;
use crate::store::{SnapshotRecord, Store};

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedSnapshot<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Explicitly populated cache of domain objects, one per (type, id).
pub struct SnapshotCache<S: Store> {
  storage: Arc<S>,
  /// Snapshots older than this are neither served nor kept
  max_age: Duration,
}

impl<S: Store> SnapshotCache<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      max_age: Duration::hours(24),
    }
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  /// Store or overwrite the snapshot of `entity`.
  pub fn cache_snapshot<T: Cacheable>(&self, entity: &T) -> Result<()> {
    let data =
      serde_json::to_value(entity).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    self.storage.put_snapshot(&SnapshotRecord {
      entity_type: T::entity_type().to_string(),
      entity_id: entity.cache_key(),
      data,
      cached_at: Utc::now(),
    })
  }

  /// All unexpired snapshots of type `T`, oldest first.
  ///
  /// Rows that no longer deserialize into `T` are skipped.
  pub fn cached_snapshots<T: Cacheable>(&self) -> Result<Vec<CachedSnapshot<T>>> {
    let cutoff = self.cutoff();

    let snapshots = self
      .storage
      .get_snapshots(T::entity_type())?
      .into_iter()
      .filter(|record| record.cached_at >= cutoff)
      .filter_map(|record| match serde_json::from_value::<T>(record.data) {
        Ok(entity) => Some(CachedSnapshot {
          entity,
          cached_at: record.cached_at,
        }),
        Err(e) => {
          warn!(
            entity_type = T::entity_type(),
            id = %record.entity_id,
            error = %e,
            "skipping unreadable snapshot"
          );
          None
        }
      })
      .collect();

    Ok(snapshots)
  }

  /// Delete every snapshot older than the max age.
  pub fn evict_expired(&self) -> Result<usize> {
    let evicted = self.storage.evict_snapshots(self.cutoff())?;
    if evicted > 0 {
      debug!(evicted, "evicted expired snapshots");
    }
    Ok(evicted)
  }

  /// Oldest `cached_at` still served. Saturates for very large max ages.
  fn cutoff(&self) -> DateTime<Utc> {
    Utc::now()
      .checked_sub_signed(self.max_age)
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }
}

impl<S: Store> Clone for SnapshotCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      max_age: self.max_age,
    }
  }
}
