//! Drains the pending-operation queue when connectivity allows.
//!
//! State is (connectivity, drain). Transitions:
//!
//! | event   | state             | effect                          |
//! |---------|-------------------|---------------------------------|
//! | Online  | was offline, idle | start drain                     |
//! | Online  | was offline, busy | record online, no new drain     |
//! | Offline | any               | record offline                  |
//! | Trigger | online, idle      | start drain                     |
//! | Trigger | offline or busy   | ignored                         |
//!
//! At most one drain runs at a time. Within a drain, operations dispatch one at a
//! time in insertion order.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::connectivity::{ConnectivityMonitor, NetworkState};
use crate::queue::{PendingOperation, PendingQueue};
use crate::store::Store;

/// Submits a queued operation to the ledger.
#[async_trait]
pub trait Broadcaster: Send + Sync {
  /// `Ok` only once the ledger has accepted the operation.
  async fn dispatch(&self, operation: &PendingOperation) -> Result<()>;
}

/// Input to the coordinator's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
  Online,
  Offline,
  /// Manual "sync now" request
  Trigger,
}

impl From<NetworkState> for SyncEvent {
  fn from(state: NetworkState) -> Self {
    match state {
      NetworkState::Online => SyncEvent::Online,
      NetworkState::Offline => SyncEvent::Offline,
    }
  }
}

/// What the coordinator did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
  DrainStarted,
  Ignored,
}

/// Progress published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
  pub online: bool,
  pub draining: bool,
  /// Operations handled so far in the current pass
  pub processed: usize,
  /// Operations in the current pass
  pub total: usize,
  pub pending: usize,
  pub failed: usize,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
}

#[derive(Debug)]
struct State {
  /// Last connectivity seen through an event, used to detect transitions
  last_seen: NetworkState,
  draining: bool,
}

/// Owns every status transition of queued operations.
pub struct SyncCoordinator<S: Store, B: Broadcaster> {
  queue: PendingQueue<S>,
  broadcaster: Arc<B>,
  connectivity: ConnectivityMonitor,
  state: Arc<Mutex<State>>,
  status: Arc<watch::Sender<SyncStatus>>,
  dispatch_timeout: Duration,
}

impl<S, B> SyncCoordinator<S, B>
where
  S: Store + 'static,
  B: Broadcaster + 'static,
{
  pub fn new(queue: PendingQueue<S>, broadcaster: Arc<B>, connectivity: ConnectivityMonitor) -> Self {
    let (status, _rx) = watch::channel(SyncStatus::default());
    Self {
      queue,
      broadcaster,
      connectivity,
      state: Arc::new(Mutex::new(State {
        last_seen: NetworkState::Offline,
        draining: false,
      })),
      status: Arc::new(status),
      dispatch_timeout: Duration::from_secs(30),
    }
  }

  /// Bound on a single dispatch. A dispatch that exceeds it counts as failed.
  pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
    self.dispatch_timeout = dispatch_timeout;
    self
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn is_syncing(&self) -> bool {
    self.state.lock().map(|s| s.draining).unwrap_or(false)
  }

  /// Consume events until every sender is dropped.
  pub async fn run(self, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
      let transition = self.handle_event(event);
      debug!(?event, ?transition, "sync event");
    }
  }

  /// Apply one event. A drain, if started, runs in a detached task.
  pub fn handle_event(&self, event: SyncEvent) -> Transition {
    match event {
      SyncEvent::Offline => {
        if let Ok(mut state) = self.state.lock() {
          state.last_seen = NetworkState::Offline;
        }
        self.status.send_modify(|s| s.online = false);
        Transition::WentOffline
      }
      SyncEvent::Online => {
        let was_offline = match self.state.lock() {
          Ok(mut state) => {
            let was_offline = state.last_seen == NetworkState::Offline;
            state.last_seen = NetworkState::Online;
            was_offline
          }
          Err(_) => return Transition::Ignored,
        };
        self.status.send_modify(|s| s.online = true);

        if !was_offline {
          Transition::Ignored
        } else if self.try_begin_drain() {
          self.spawn_drain();
          Transition::DrainStarted
        } else {
          Transition::WentOnline
        }
      }
      SyncEvent::Trigger => {
        if self.try_begin_drain() {
          self.spawn_drain();
          Transition::DrainStarted
        } else {
          debug!("sync trigger ignored: offline or already draining");
          Transition::Ignored
        }
      }
    }
  }

  /// Drain inline. Returns `None` if offline or a drain is already running.
  pub async fn drain_now(&self) -> Result<Option<DrainReport>> {
    if !self.try_begin_drain() {
      return Ok(None);
    }
    self.drain_claimed().await.map(Some)
  }

  /// Refresh the queue counts published on the status channel.
  pub fn refresh_counts(&self) -> Result<()> {
    let pending = self.queue.pending_count()?;
    let failed = self.queue.failed_count()?;
    self.status.send_modify(|s| {
      s.pending = pending;
      s.failed = failed;
    });
    Ok(())
  }

  /// Atomically move idle → draining. Fails while offline or already draining.
  fn try_begin_drain(&self) -> bool {
    if !self.connectivity.is_online() {
      return false;
    }
    let Ok(mut state) = self.state.lock() else {
      return false;
    };
    if state.draining {
      return false;
    }
    state.draining = true;
    true
  }

  fn finish_drain(&self) {
    if let Ok(mut state) = self.state.lock() {
      state.draining = false;
    }
    self.status.send_modify(|s| s.draining = false);
  }

  fn spawn_drain(&self) {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(e) = this.drain_claimed().await {
        error!(error = %e, "drain aborted");
      }
    });
  }

  /// Run a pass after `try_begin_drain` succeeded. Always returns to idle.
  async fn drain_claimed(&self) -> Result<DrainReport> {
    let result = self.drain_pass().await;
    self.finish_drain();
    if let Err(e) = self.refresh_counts() {
      warn!(error = %e, "failed to refresh queue counts");
    }
    result
  }

  async fn drain_pass(&self) -> Result<DrainReport> {
    let operations = self.queue.list_pending()?;
    let total = operations.len();
    self.status.send_modify(|s| {
      s.draining = true;
      s.processed = 0;
      s.total = total;
    });

    if operations.is_empty() {
      debug!("drain pass: queue empty");
      return Ok(DrainReport::default());
    }

    info!(total, "draining pending operations");
    let mut report = DrainReport::default();

    for operation in operations {
      report.attempted += 1;

      match self.dispatch(&operation).await {
        Ok(()) => {
          self.queue.remove(operation.id)?;
          report.succeeded += 1;
          info!(id = operation.id, kind = %operation.kind, "operation confirmed");
        }
        Err(e) => {
          self.queue.mark_failed(operation.id, &e.to_string())?;
          report.failed += 1;
          warn!(id = operation.id, kind = %operation.kind, error = %e, "operation failed");
        }
      }

      self.status.send_modify(|s| s.processed += 1);
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      "drain pass complete"
    );
    Ok(report)
  }

  async fn dispatch(&self, operation: &PendingOperation) -> Result<()> {
    match tokio::time::timeout(self.dispatch_timeout, self.broadcaster.dispatch(operation)).await {
      Ok(result) => result,
      Err(_) => Err(eyre!(
        "Dispatch timed out after {}s",
        self.dispatch_timeout.as_secs_f64()
      )),
    }
  }
}

impl<S: Store, B: Broadcaster> Clone for SyncCoordinator<S, B> {
  fn clone(&self) -> Self {
    Self {
      queue: self.queue.clone(),
      broadcaster: Arc::clone(&self.broadcaster),
      connectivity: self.connectivity.clone(),
      state: Arc::clone(&self.state),
      status: Arc::clone(&self.status),
      dispatch_timeout: self.dispatch_timeout,
    }
  }
}
