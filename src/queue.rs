//! Durable queue of write intents awaiting dispatch to the ledger.
//!
//! Operations are recorded before any network attempt so a dropped connection
//! never loses a user's action. Entries leave the queue only after the ledger
//! confirms them; failures stay queued with status `failed`.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::store::Store;

/// The kind of write a queued operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
  Create,
  StakeYes,
  StakeNo,
  Resolve,
  Claim,
}

impl OperationKind {
  pub const ALL: [OperationKind; 5] = [
    Self::Create,
    Self::StakeYes,
    Self::StakeNo,
    Self::Resolve,
    Self::Claim,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::StakeYes => "stake-yes",
      Self::StakeNo => "stake-no",
      Self::Resolve => "resolve",
      Self::Claim => "claim",
    }
  }
}

impl FromStr for OperationKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| eyre!("Unknown operation kind: {}", s))
  }
}

impl std::fmt::Display for OperationKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Pending,
  Failed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Failed => "failed",
    }
  }
}

impl FromStr for OperationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown operation status: {}", other)),
    }
  }
}

/// A queued write intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
  /// Strictly increasing, never reused
  pub id: i64,
  pub kind: OperationKind,
  pub params: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  pub status: OperationStatus,
  /// Failed dispatch attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// Queue facade over the store's operation table.
pub struct PendingQueue<S: Store> {
  storage: Arc<S>,
}

impl<S: Store> PendingQueue<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Record a write intent. Returns its id.
  pub fn enqueue(&self, kind: OperationKind, params: serde_json::Value) -> Result<i64> {
    let id = self.storage.insert_operation(kind, &params, Utc::now())?;
    info!(id, kind = %kind, "queued operation");
    Ok(id)
  }

  /// Every queued operation, pending or failed, in insertion order.
  pub fn list_pending(&self) -> Result<Vec<PendingOperation>> {
    self.storage.list_operations()
  }

  pub(crate) fn remove(&self, id: i64) -> Result<()> {
    if !self.storage.delete_operation(id)? {
      return Err(eyre!("Operation {} is not queued", id));
    }
    Ok(())
  }

  pub(crate) fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
    if !self.storage.mark_operation_failed(id, error)? {
      return Err(eyre!("Operation {} is not queued", id));
    }
    Ok(())
  }

  /// Queued operations awaiting confirmation, including failed ones.
  pub fn pending_count(&self) -> Result<usize> {
    self.storage.count_operations(false)
  }

  pub fn failed_count(&self) -> Result<usize> {
    self.storage.count_operations(true)
  }
}

impl<S: Store> Clone for PendingQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
