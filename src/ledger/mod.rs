//! Ledger-facing collaborators: domain types and the HTTP implementations of
//! the transport, broadcast and health-probe seams.

mod cache;
pub mod client;
pub mod types;

pub use client::{HttpBroadcaster, HttpProbe, HttpTransport};
pub use types::{Market, Outcome, Position};
