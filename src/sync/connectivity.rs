//! Online/offline signal shared by the platform and the sync coordinator.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
  Online,
  Offline,
}

impl NetworkState {
  pub fn toggled(self) -> Self {
    match self {
      NetworkState::Online => NetworkState::Offline,
      NetworkState::Offline => NetworkState::Online,
    }
  }
}

/// Latest connectivity plus the number of transitions so far.
///
/// A watch receiver only sees the newest value, so a quick offline/online flap
/// can look like no change at all. The counter exposes what was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
  pub state: NetworkState,
  pub transitions: u64,
}

/// Current connectivity plus a stream of transitions.
///
/// The platform (or [`probe_loop`]) calls [`set`](Self::set); consumers read
/// [`current`](Self::current) or [`subscribe`](Self::subscribe) for changes.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<Reading>>,
}

impl ConnectivityMonitor {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _rx) = watch::channel(Reading {
      state: initial,
      transitions: 0,
    });
    Self { tx: Arc::new(tx) }
  }

  pub fn current(&self) -> NetworkState {
    self.tx.borrow().state
  }

  pub fn is_online(&self) -> bool {
    self.current() == NetworkState::Online
  }

  /// Record the latest state. Returns true if it changed.
  pub fn set(&self, state: NetworkState) -> bool {
    self.tx.send_if_modified(|current| {
      if current.state == state {
        return false;
      }
      current.state = state;
      current.transitions += 1;
      true
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<Reading> {
    self.tx.subscribe()
  }
}

/// A reachability check against the remote network.
#[async_trait]
pub trait HealthProbe: Send + Sync {
  async fn is_reachable(&self) -> bool;
}

/// Poll `probe` every `interval` and feed the result into `monitor`. Runs forever.
pub async fn probe_loop<P: HealthProbe>(monitor: ConnectivityMonitor, probe: P, interval: Duration) {
  let mut ticker = tokio::time::interval(interval);
  loop {
    ticker.tick().await;
    let state = if probe.is_reachable().await {
      NetworkState::Online
    } else {
      NetworkState::Offline
    };
    if monitor.set(state) {
      info!(?state, "connectivity changed");
    }
  }
}
