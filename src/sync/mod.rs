//! Write-path reconciliation: connectivity signal plus the queue-draining
//! state machine.

mod connectivity;
mod coordinator;

pub use connectivity::{probe_loop, ConnectivityMonitor, HealthProbe, NetworkState, Reading};
pub use coordinator::{Broadcaster, DrainReport, SyncCoordinator, SyncEvent, SyncStatus, Transition};
