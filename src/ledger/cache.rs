//! Caching implementations for ledger types.

use crate::cache::Cacheable;

use super::types::{Market, Position};

impl Cacheable for Market {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "market"
  }
}

impl Cacheable for Position {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "position"
  }
}
