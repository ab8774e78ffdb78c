//! Persistent store shared by the response cache, the snapshot cache and the
//! pending-operation queue.
//!
//! Every component owns its own tables. The cache never touches queued operations
//! and the queue never touches cache entries, so sharing one database file does not
//! couple their lifecycles.

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::cache::{Namespace, Response};
use crate::queue::{OperationKind, PendingOperation};

pub use sqlite::SqliteStore;

/// A response stored in a cache namespace.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub response: Response,
  /// When the response was fetched from the network
  pub inserted_at: DateTime<Utc>,
}

/// A raw domain snapshot row.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
  pub entity_type: String,
  pub entity_id: String,
  pub data: serde_json::Value,
  pub cached_at: DateTime<Utc>,
}

/// Durable storage backend.
///
/// Each method is atomic: callers never observe a partially applied write.
pub trait Store: Send + Sync {
  // -- response cache --------------------------------------------------------

  /// Make `active` the only namespaces in the store, registering them if needed.
  ///
  /// Entries of every other namespace are deleted. Returns the number of
  /// entries removed.
  fn retain_namespaces(&self, active: &[Namespace]) -> Result<usize>;

  /// Names of all registered namespaces.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Look up a cached response by request fingerprint.
  fn get_response(&self, namespace: &str, fingerprint: &str) -> Result<Option<StoredResponse>>;

  /// Insert or overwrite a cached response.
  fn put_response(
    &self,
    namespace: &str,
    fingerprint: &str,
    url: &str,
    response: &Response,
    inserted_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Number of entries held by a namespace.
  fn count_responses(&self, namespace: &str) -> Result<usize>;

  // -- domain snapshots ------------------------------------------------------

  /// Insert or overwrite the snapshot for `(entity_type, entity_id)`.
  fn put_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

  /// All snapshots of one entity type, oldest first.
  fn get_snapshots(&self, entity_type: &str) -> Result<Vec<SnapshotRecord>>;

  /// Delete snapshots cached before `cutoff`. Returns how many were removed.
  fn evict_snapshots(&self, cutoff: DateTime<Utc>) -> Result<usize>;

  // -- pending operations ----------------------------------------------------

  /// Append an operation and return its id.
  fn insert_operation(
    &self,
    kind: OperationKind,
    params: &serde_json::Value,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64>;

  /// All queued operations (pending and failed) in insertion order.
  fn list_operations(&self) -> Result<Vec<PendingOperation>>;

  /// Delete an operation. Returns false if no such operation exists.
  fn delete_operation(&self, id: i64) -> Result<bool>;

  /// Flag an operation as failed and record the error.
  fn mark_operation_failed(&self, id: i64, error: &str) -> Result<bool>;

  /// Count queued operations, optionally restricted to failed ones.
  fn count_operations(&self, failed_only: bool) -> Result<usize>;
}
