use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side of a binary market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Yes,
  No,
}

/// Market state as read from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
  pub id: String,
  pub title: String,
  pub yes_pool: u64,
  pub no_pool: u64,
  /// Set once the market has been resolved
  pub resolved: Option<Outcome>,
  pub closes_at: Option<DateTime<Utc>>,
}

/// A user's stake in a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub id: String,
  pub market_id: String,
  pub owner: String,
  pub side: Outcome,
  pub amount: u64,
  #[serde(default)]
  pub claimed: bool,
}
