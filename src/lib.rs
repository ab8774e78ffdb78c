//! Offline resilience for ledger clients.
//!
//! Reads go through a versioned response cache ([`cache`]); writes made while
//! offline are queued durably ([`queue`]) and drained by the sync coordinator
//! ([`sync`]) once connectivity returns. [`OfflineLayer`] ties them together.

pub mod cache;
pub mod config;
pub mod ledger;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use service::OfflineLayer;
