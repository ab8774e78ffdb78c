//! Fake collaborators for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::{Request, Response, Transport};
use crate::queue::PendingOperation;
use crate::sync::Broadcaster;

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  while !condition() {
    assert!(
      tokio::time::Instant::now() < deadline,
      "condition not reached in time"
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

/// Take one permit from the gate, if any, before continuing.
async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
  let gate = gate.lock().unwrap().clone();
  if let Some(gate) = gate {
    gate.acquire().await.unwrap().forget();
  }
}

/// Transport answering from a URL → response table.
///
/// Unknown URLs get a 404. `set_offline(true)` makes every fetch fail.
pub struct FakeTransport {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicU32,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      offline: AtomicBool::new(false),
      calls: AtomicU32::new(0),
      gate: Mutex::new(None),
    }
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }

  /// Block fetches until permits are added to the returned semaphore.
  pub fn hold(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub fn release(&self) {
    if let Some(gate) = self.gate.lock().unwrap().take() {
      gate.add_permits(1024);
    }
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    pass_gate(&self.gate).await;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

/// Broadcaster that records dispatch order and fails selected ids.
pub struct FakeBroadcaster {
  dispatched: Mutex<Vec<i64>>,
  failing: Mutex<HashSet<i64>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeBroadcaster {
  pub fn new() -> Self {
    Self {
      dispatched: Mutex::new(Vec::new()),
      failing: Mutex::new(HashSet::new()),
      gate: Mutex::new(None),
    }
  }

  pub fn fail_on(&self, id: i64) {
    self.failing.lock().unwrap().insert(id);
  }

  pub fn clear_failures(&self) {
    self.failing.lock().unwrap().clear();
  }

  /// Ids in the order they were dispatched, including failures.
  pub fn dispatched(&self) -> Vec<i64> {
    self.dispatched.lock().unwrap().clone()
  }

  /// Block dispatches until permits are added to the returned semaphore.
  pub fn hold(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
  async fn dispatch(&self, operation: &PendingOperation) -> Result<()> {
    self.dispatched.lock().unwrap().push(operation.id);
    pass_gate(&self.gate).await;

    if self.failing.lock().unwrap().contains(&operation.id) {
      return Err(eyre!("ledger rejected operation {}", operation.id));
    }
    Ok(())
  }
}
