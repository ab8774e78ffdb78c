//! SQLite implementation of [`Store`].

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::schema::SCHEMA;
use super::{SnapshotRecord, Store, StoredResponse};
use crate::cache::{Namespace, Response};
use crate::queue::{OperationKind, OperationStatus, PendingOperation};

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledgersync").join("state.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl Store for SqliteStore {
  fn retain_namespaces(&self, active: &[Namespace]) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let keep: HashSet<String> = active.iter().map(Namespace::name).collect();
    let now = format_datetime(Utc::now());

    for namespace in active {
      tx.execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, class, version, activated_at)
         VALUES (?, ?, ?, ?)",
        params![
          namespace.name(),
          namespace.class.as_str(),
          namespace.version,
          now
        ],
      )
      .map_err(|e| eyre!("Failed to register namespace: {}", e))?;
    }

    // Entries may outlive their namespace row (e.g. a crash between writes), so
    // collect names from both tables.
    let existing: Vec<String> = {
      let mut stmt = tx
        .prepare(
          "SELECT name FROM cache_namespaces
           UNION SELECT DISTINCT namespace FROM cache_entries",
        )
        .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;
      let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list namespaces: {}", e))?;
      rows
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read namespace: {}", e))?
    };

    let mut purged = 0;
    for name in existing.iter().filter(|name| !keep.contains(*name)) {
      purged += tx
        .execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])
        .map_err(|e| eyre!("Failed to purge namespace {}: {}", name, e))?;
      tx.execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
        .map_err(|e| eyre!("Failed to retire namespace {}: {}", name, e))?;
      debug!(namespace = %name, "retired cache namespace");
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(purged)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let rows = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?;
    rows
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))
  }

  fn get_response(&self, namespace: &str, fingerprint: &str) -> Result<Option<StoredResponse>> {
    let conn = self.conn()?;

    let row: Option<(i64, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, inserted_at FROM cache_entries
         WHERE namespace = ? AND fingerprint = ?",
        params![namespace, fingerprint],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((status, headers, body, inserted_at)) = row else {
      return Ok(None);
    };

    let status =
      u16::try_from(status).map_err(|_| eyre!("Corrupt status code in cache: {}", status))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(Some(StoredResponse {
      response: Response {
        status,
        headers,
        body,
      },
      inserted_at: parse_datetime(&inserted_at)?,
    }))
  }

  fn put_response(
    &self,
    namespace: &str,
    fingerprint: &str,
    url: &str,
    response: &Response,
    inserted_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, fingerprint, url, status, headers, body, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          fingerprint,
          url,
          i64::from(response.status),
          headers,
          response.body,
          format_datetime(inserted_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn count_responses(&self, namespace: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    usize::try_from(count).map_err(|_| eyre!("Corrupt cache entry count: {}", count))
  }

  fn put_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO snapshots (entity_type, entity_id, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![
          record.entity_type,
          record.entity_id,
          record.data.to_string(),
          format_datetime(record.cached_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store snapshot: {}", e))?;
    Ok(())
  }

  fn get_snapshots(&self, entity_type: &str) -> Result<Vec<SnapshotRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT entity_id, data, cached_at FROM snapshots
         WHERE entity_type = ?
         ORDER BY cached_at, entity_id",
      )
      .map_err(|e| eyre!("Failed to prepare snapshot query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map(params![entity_type], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to query snapshots: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read snapshot: {}", e))?;

    rows
      .into_iter()
      .map(|(entity_id, data, cached_at)| -> Result<SnapshotRecord> {
        Ok(SnapshotRecord {
          entity_type: entity_type.to_string(),
          data: serde_json::from_str(&data)
            .map_err(|e| eyre!("Failed to deserialize snapshot {}: {}", entity_id, e))?,
          entity_id,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn evict_snapshots(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM snapshots WHERE cached_at < ?",
        params![format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to evict snapshots: {}", e))
  }

  fn insert_operation(
    &self,
    kind: OperationKind,
    params: &serde_json::Value,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO pending_operations (kind, params, enqueued_at, status)
         VALUES (?, ?, ?, ?)",
        params![
          kind.as_str(),
          params.to_string(),
          format_datetime(enqueued_at),
          OperationStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list_operations(&self) -> Result<Vec<PendingOperation>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, kind, params, enqueued_at, status, attempts, last_error
         FROM pending_operations
         WHERE status IN ('pending', 'failed')
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare operation query: {}", e))?;

    type Row = (i64, String, String, String, String, i64, Option<String>);
    let rows: Vec<Row> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query operations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read operation: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, kind, params, enqueued_at, status, attempts, last_error)| -> Result<PendingOperation> {
          Ok(PendingOperation {
            id,
            kind: kind.parse()?,
            params: serde_json::from_str(&params)
              .map_err(|e| eyre!("Failed to deserialize params of operation {}: {}", id, e))?,
            enqueued_at: parse_datetime(&enqueued_at)?,
            status: status.parse()?,
            attempts: u32::try_from(attempts)
              .map_err(|_| eyre!("Corrupt attempt count for operation {}: {}", id, attempts))?,
            last_error,
          })
        },
      )
      .collect()
  }

  fn delete_operation(&self, id: i64) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove operation {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  fn mark_operation_failed(&self, id: i64, error: &str) -> Result<bool> {
    let conn = self.conn()?;
    let updated = conn
      .execute(
        "UPDATE pending_operations
         SET status = ?, attempts = attempts + 1, last_error = ?
         WHERE id = ?",
        params![OperationStatus::Failed.as_str(), error, id],
      )
      .map_err(|e| eyre!("Failed to mark operation {} failed: {}", id, e))?;
    Ok(updated > 0)
  }

  fn count_operations(&self, failed_only: bool) -> Result<usize> {
    let conn = self.conn()?;
    let sql = if failed_only {
      "SELECT COUNT(*) FROM pending_operations WHERE status = 'failed'"
    } else {
      "SELECT COUNT(*) FROM pending_operations WHERE status IN ('pending', 'failed')"
    };
    let count: i64 = conn
      .query_row(sql, [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count operations: {}", e))?;
    usize::try_from(count).map_err(|_| eyre!("Corrupt operation count: {}", count))
  }
}

/// Timestamps are stored as fixed-width RFC 3339 so they compare lexically.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResourceClass;
  use chrono::Duration;
  use serde_json::json;

  fn ok_response(body: &str) -> Response {
    Response::new(200, body.as_bytes().to_vec())
  }

  #[test]
  fn test_operation_ids_increase_after_removal() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = store
      .insert_operation(OperationKind::Claim, &json!({}), Utc::now())
      .unwrap();
    assert!(store.delete_operation(first).unwrap());

    let second = store
      .insert_operation(OperationKind::Claim, &json!({}), Utc::now())
      .unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_mark_failed_records_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store
      .insert_operation(OperationKind::StakeYes, &json!({"amount": 5}), Utc::now())
      .unwrap();

    assert!(store.mark_operation_failed(id, "rejected").unwrap());
    assert!(store.mark_operation_failed(id, "rejected again").unwrap());

    let ops = store.list_operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].attempts, 2);
    assert_eq!(ops[0].last_error.as_deref(), Some("rejected again"));
    assert_eq!(ops[0].params, json!({"amount": 5}));
    assert_eq!(store.count_operations(true).unwrap(), 1);
  }

  #[test]
  fn test_unknown_operation_is_reported() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(!store.delete_operation(42).unwrap());
    assert!(!store.mark_operation_failed(42, "nope").unwrap());
  }

  #[test]
  fn test_corrupt_attempt_count_is_an_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .insert_operation(OperationKind::Resolve, &json!({}), Utc::now())
      .unwrap();
    store
      .conn()
      .unwrap()
      .execute("UPDATE pending_operations SET attempts = -1", [])
      .unwrap();

    let err = store.list_operations().unwrap_err();
    assert!(err.to_string().contains("Corrupt attempt count"));
  }

  #[test]
  fn test_retain_namespaces_purges_retired_entries() {
    let store = SqliteStore::open_in_memory().unwrap();
    let v1 = Namespace::new(ResourceClass::Api, "v1");
    let v2 = Namespace::new(ResourceClass::Api, "v2");

    store.retain_namespaces(std::slice::from_ref(&v1)).unwrap();
    store
      .put_response(&v1.name(), "abc", "https://x/api", &ok_response("old"), Utc::now())
      .unwrap();

    let purged = store.retain_namespaces(std::slice::from_ref(&v2)).unwrap();
    assert_eq!(purged, 1);
    assert_eq!(store.namespaces().unwrap(), vec!["api-v2".to_string()]);
    assert!(store.get_response(&v1.name(), "abc").unwrap().is_none());
  }

  #[test]
  fn test_response_roundtrip_keeps_headers_and_time() {
    let store = SqliteStore::open_in_memory().unwrap();
    let inserted_at = Utc::now() - Duration::minutes(10);
    let response = ok_response("{}").with_header("content-type", "application/json");

    store
      .put_response("api-v1", "k", "https://x/api/markets", &response, inserted_at)
      .unwrap();

    let stored = store.get_response("api-v1", "k").unwrap().unwrap();
    assert_eq!(stored.response, response);
    assert_eq!(
      stored.inserted_at.timestamp_millis(),
      inserted_at.timestamp_millis()
    );
  }

  #[test]
  fn test_evict_snapshots_by_age() {
    let store = SqliteStore::open_in_memory().unwrap();
    let now = Utc::now();
    for (id, age) in [("old", 48), ("new", 1)] {
      store
        .put_snapshot(&SnapshotRecord {
          entity_type: "market".to_string(),
          entity_id: id.to_string(),
          data: json!({ "id": id }),
          cached_at: now - Duration::hours(age),
        })
        .unwrap();
    }

    let evicted = store.evict_snapshots(now - Duration::hours(24)).unwrap();
    assert_eq!(evicted, 1);

    let left = store.get_snapshots("market").unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].entity_id, "new");
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    let id = {
      let store = SqliteStore::open(&path).unwrap();
      store
        .insert_operation(OperationKind::Resolve, &json!({"market": "m1"}), Utc::now())
        .unwrap()
    };

    let store = SqliteStore::open(&path).unwrap();
    let ops = store.list_operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].id, id);
    assert_eq!(ops[0].kind, OperationKind::Resolve);
  }
}
