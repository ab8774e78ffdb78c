//! The offline layer as one service object.
//!
//! Constructed once at startup with its collaborators injected, then shared by
//! reference with whatever needs reads, writes or sync status.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{
  CacheResult, CacheSource, CacheVersions, Cacheable, CachedSnapshot, Request, Response,
  ResponseCache, SnapshotCache, Transport,
};
use crate::config::Config;
use crate::queue::{OperationKind, PendingOperation, PendingQueue};
use crate::store::Store;
use crate::sync::{
  Broadcaster, ConnectivityMonitor, DrainReport, Reading, SyncCoordinator, SyncEvent,
  SyncStatus,
};

pub struct OfflineLayer<S: Store, T: Transport, B: Broadcaster> {
  cache: ResponseCache<S, T>,
  snapshots: SnapshotCache<S>,
  queue: PendingQueue<S>,
  coordinator: SyncCoordinator<S, B>,
  connectivity: ConnectivityMonitor,
  events: mpsc::UnboundedSender<SyncEvent>,
  /// Taken by `start`
  receiver: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
}

impl<S, T, B> OfflineLayer<S, T, B>
where
  S: Store + 'static,
  T: Transport + 'static,
  B: Broadcaster + 'static,
{
  /// Build the layer. Activates the configured cache versions and evicts
  /// expired snapshots before returning.
  pub fn new(
    store: Arc<S>,
    transport: Arc<T>,
    broadcaster: Arc<B>,
    connectivity: ConnectivityMonitor,
    config: &Config,
  ) -> Result<Self> {
    let cache = ResponseCache::new(
      Arc::clone(&store),
      transport,
      config.classifier()?,
      config.cache.versions.clone(),
    )?
    .with_api_freshness(config.cache.api_freshness());

    let snapshots =
      SnapshotCache::new(Arc::clone(&store)).with_max_age(config.cache.snapshot_max_age());
    snapshots.evict_expired()?;

    let queue = PendingQueue::new(store);
    let coordinator = SyncCoordinator::new(queue.clone(), broadcaster, connectivity.clone())
      .with_dispatch_timeout(config.sync.dispatch_timeout());
    coordinator.refresh_counts()?;

    let (events, receiver) = mpsc::unbounded_channel();

    Ok(Self {
      cache,
      snapshots,
      queue,
      coordinator,
      connectivity,
      events,
      receiver: Mutex::new(Some(receiver)),
    })
  }

  /// Start the coordinator loop, fed by connectivity changes and manual
  /// triggers. The current connectivity is delivered first, so starting while
  /// online drains anything left over from a previous run.
  ///
  /// Returns `None` if already started.
  pub fn start(&self) -> Option<JoinHandle<()>> {
    let receiver = self.receiver.lock().ok()?.take()?;

    let mut changes = self.connectivity.subscribe();
    let events = self.events.clone();
    tokio::spawn(async move {
      let mut seen = None;
      loop {
        let reading = *changes.borrow_and_update();
        for event in connectivity_events(seen, reading) {
          if events.send(event).is_err() {
            return;
          }
        }
        seen = Some(reading.transitions);
        if changes.changed().await.is_err() {
          break;
        }
      }
    });

    Some(tokio::spawn(self.coordinator.clone().run(receiver)))
  }

  // -- reads -----------------------------------------------------------------

  pub async fn intercept(&self, request: &Request) -> Result<CacheResult<Response>> {
    self.cache.intercept(request).await
  }

  /// Read a JSON array of entities through the cache, snapshotting each one.
  ///
  /// When the network and response cache both come up empty, the last
  /// snapshots of `E` are served instead.
  pub async fn read_collection<E: Cacheable>(
    &self,
    request: &Request,
  ) -> Result<CacheResult<Vec<E>>> {
    let result = self.intercept(request).await?;

    if result.data.is_success() {
      match serde_json::from_slice::<Vec<E>>(&result.data.body) {
        Ok(entities) => {
          for entity in &entities {
            self.snapshots.cache_snapshot(entity)?;
          }
          return Ok(CacheResult {
            data: entities,
            source: result.source,
            cached_at: result.cached_at,
          });
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "unexpected collection payload");
        }
      }
    } else if result.source != CacheSource::Placeholder {
      return Err(eyre!(
        "Request to {} failed with status {}",
        request.url,
        result.data.status
      ));
    }

    let snapshots = self.snapshots.cached_snapshots::<E>()?;
    debug!(
      entity_type = E::entity_type(),
      count = snapshots.len(),
      "serving snapshots"
    );
    let Some(oldest) = snapshots.iter().map(|s| s.cached_at).min() else {
      return Ok(CacheResult {
        data: Vec::new(),
        source: CacheSource::Placeholder,
        cached_at: None,
      });
    };
    let entities = snapshots.into_iter().map(|s| s.entity).collect();
    Ok(CacheResult::from_cache(entities, oldest, true))
  }

  pub async fn activate(&self, versions: CacheVersions) -> Result<usize> {
    self.cache.activate(versions).await
  }

  pub async fn precache(&self) -> Result<usize> {
    self.cache.precache().await
  }

  pub fn cache_snapshot<E: Cacheable>(&self, entity: &E) -> Result<()> {
    self.snapshots.cache_snapshot(entity)
  }

  pub fn cached_snapshots<E: Cacheable>(&self) -> Result<Vec<CachedSnapshot<E>>> {
    self.snapshots.cached_snapshots()
  }

  pub fn evict_expired_snapshots(&self) -> Result<usize> {
    self.snapshots.evict_expired()
  }

  // -- writes ----------------------------------------------------------------

  /// Durably record a write intent. It is dispatched by the next drain.
  pub fn enqueue(&self, kind: OperationKind, params: serde_json::Value) -> Result<i64> {
    let id = self.queue.enqueue(kind, params)?;
    self.coordinator.refresh_counts()?;
    Ok(id)
  }

  pub fn list_pending(&self) -> Result<Vec<PendingOperation>> {
    self.queue.list_pending()
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.queue.pending_count()
  }

  pub fn failed_count(&self) -> Result<usize> {
    self.queue.failed_count()
  }

  // -- sync ------------------------------------------------------------------

  pub fn is_syncing(&self) -> bool {
    self.coordinator.is_syncing()
  }

  /// Ask for an immediate drain. Ignored while offline or already draining.
  pub fn trigger_sync(&self) {
    if self.events.send(SyncEvent::Trigger).is_err() {
      debug!("sync trigger dropped: coordinator stopped");
    }
  }

  /// Drain inline and wait for the report. `None` if offline or busy.
  pub async fn sync_now(&self) -> Result<Option<DrainReport>> {
    self.coordinator.drain_now().await
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.coordinator.subscribe()
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }
}

/// Events for a connectivity reading, given the transition count last forwarded.
///
/// When transitions were overwritten before the forwarder saw them, the state
/// the link passed through is replayed first so a flap is not lost.
fn connectivity_events(seen: Option<u64>, reading: Reading) -> Vec<SyncEvent> {
  match seen {
    Some(seen) if reading.transitions > seen + 1 => {
      vec![reading.state.toggled().into(), reading.state.into()]
    }
    Some(seen) if reading.transitions == seen => Vec::new(),
    _ => vec![reading.state.into()],
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ledger::{Market, Position};
  use crate::queue::OperationStatus;
  use crate::store::SqliteStore;
  use crate::sync::NetworkState;
  use crate::test_utils::{wait_until, FakeBroadcaster, FakeTransport};
  use serde_json::json;
  use std::time::Duration;

  const CONFIG: &str = r#"
origin: https://app.example
cache:
  static_resources: ["/"]
sync:
  broadcast_url: https://ledger.example/ops
"#;

  type TestLayer = OfflineLayer<SqliteStore, FakeTransport, FakeBroadcaster>;

  struct Harness {
    layer: TestLayer,
    transport: Arc<FakeTransport>,
    broadcaster: Arc<FakeBroadcaster>,
    connectivity: ConnectivityMonitor,
  }

  fn harness(initial: NetworkState) -> Harness {
    let config = Config::from_yaml(CONFIG).unwrap();
    let transport = Arc::new(FakeTransport::new());
    let broadcaster = Arc::new(FakeBroadcaster::new());
    let connectivity = ConnectivityMonitor::new(initial);
    let layer = OfflineLayer::new(
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      Arc::clone(&transport),
      Arc::clone(&broadcaster),
      connectivity.clone(),
      &config,
    )
    .unwrap();
    Harness {
      layer,
      transport,
      broadcaster,
      connectivity,
    }
  }

  fn enqueue_three(layer: &TestLayer) -> Vec<i64> {
    vec![
      layer
        .enqueue(OperationKind::Create, json!({"title": "Will it rain?"}))
        .unwrap(),
      layer
        .enqueue(OperationKind::StakeYes, json!({"market": "m1", "amount": 5}))
        .unwrap(),
      layer
        .enqueue(OperationKind::Claim, json!({"market": "m0"}))
        .unwrap(),
    ]
  }

  #[tokio::test]
  async fn test_offline_queue_drains_on_reconnect() {
    let h = harness(NetworkState::Offline);
    h.layer.start().unwrap();

    let ids = enqueue_three(&h.layer);
    h.broadcaster.fail_on(ids[1]);
    assert_eq!(h.layer.pending_count().unwrap(), 3);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.broadcaster.dispatched().is_empty());

    h.connectivity.set(NetworkState::Online);
    let broadcaster = Arc::clone(&h.broadcaster);
    wait_until(|| broadcaster.dispatched().len() == 3).await;
    wait_until(|| !h.layer.is_syncing()).await;

    assert_eq!(h.broadcaster.dispatched(), ids);
    let left = h.layer.list_pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, ids[1]);
    assert_eq!(left[0].status, OperationStatus::Failed);
    assert_eq!(h.layer.pending_count().unwrap(), 1);
    assert_eq!(h.layer.failed_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_trigger_sync_while_draining() {
    let h = harness(NetworkState::Online);
    let ids = enqueue_three(&h.layer);
    let gate = h.broadcaster.hold();

    // Starting online drains what is queued
    h.layer.start().unwrap();
    let broadcaster = Arc::clone(&h.broadcaster);
    wait_until(|| broadcaster.dispatched().len() == 1).await;
    assert!(h.layer.is_syncing());

    h.layer.trigger_sync();
    h.layer.trigger_sync();
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.add_permits(16);
    wait_until(|| !h.layer.is_syncing()).await;

    assert_eq!(h.broadcaster.dispatched(), ids);
    assert_eq!(h.layer.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_manual_trigger_after_failure() {
    let h = harness(NetworkState::Online);
    let ids = enqueue_three(&h.layer);
    h.broadcaster.fail_on(ids[0]);

    let report = h.layer.sync_now().await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.layer.pending_count().unwrap(), 1);

    h.broadcaster.clear_failures();
    h.layer.start().unwrap();
    h.layer.trigger_sync();
    wait_until(|| h.layer.pending_count().unwrap() == 0).await;
  }

  #[tokio::test]
  async fn test_status_counts_follow_enqueue() {
    let h = harness(NetworkState::Offline);
    let status = h.layer.subscribe();
    enqueue_three(&h.layer);

    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.pending, 3);
    assert_eq!(snapshot.failed, 0);
    assert!(!snapshot.draining);
  }

  #[tokio::test]
  async fn test_read_collection_snapshots_and_falls_back() {
    let h = harness(NetworkState::Online);
    let markets = json!([
      {"id": "m1", "title": "Rain?", "yes_pool": 3, "no_pool": 1, "resolved": null, "closes_at": null},
      {"id": "m2", "title": "Snow?", "yes_pool": 0, "no_pool": 0, "resolved": "no", "closes_at": null}
    ]);
    h.transport.respond(
      "https://app.example/api/markets",
      Response::new(200, markets.to_string()),
    );

    let request = Request::parse_get("https://app.example/api/markets").unwrap();
    let live = h.layer.read_collection::<Market>(&request).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);
    assert_eq!(live.data.len(), 2);
    assert_eq!(h.layer.cached_snapshots::<Market>().unwrap().len(), 2);

    // Offline, the API cache answers first
    h.transport.set_offline(true);
    let cached = h.layer.read_collection::<Market>(&request).await.unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached.data.len(), 2);

    // A URL never fetched falls back to snapshots
    let other = Request::parse_get("https://app.example/api/markets?open=true").unwrap();
    let fallback = h.layer.read_collection::<Market>(&other).await.unwrap();
    assert_eq!(fallback.source, CacheSource::CacheStale);
    assert_eq!(fallback.data.len(), 2);

    // Nothing at all for positions
    let positions = Request::parse_get("https://app.example/api/positions").unwrap();
    let empty = h.layer.read_collection::<Position>(&positions).await.unwrap();
    assert_eq!(empty.source, CacheSource::Placeholder);
    assert!(empty.data.is_empty());
  }

  #[tokio::test]
  async fn test_read_collection_http_error() {
    let h = harness(NetworkState::Online);
    let request = Request::parse_get("https://app.example/api/missing").unwrap();
    assert!(h.layer.read_collection::<Market>(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_reconnect_flap_still_drains() {
    let h = harness(NetworkState::Online);
    h.layer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!h.layer.is_syncing());

    // No await between the two sets: the forwarder only wakes for the last one
    h.connectivity.set(NetworkState::Offline);
    let id = h
      .layer
      .enqueue(OperationKind::Claim, json!({"market": "m3"}))
      .unwrap();
    h.connectivity.set(NetworkState::Online);

    let broadcaster = Arc::clone(&h.broadcaster);
    wait_until(|| broadcaster.dispatched() == vec![id]).await;
    wait_until(|| h.layer.pending_count().unwrap() == 0).await;
  }

  #[test]
  fn test_connectivity_events_replay_skipped_transitions() {
    let online = |transitions| Reading {
      state: NetworkState::Online,
      transitions,
    };

    assert_eq!(connectivity_events(None, online(4)), vec![SyncEvent::Online]);
    assert_eq!(connectivity_events(Some(4), online(4)), Vec::new());
    assert_eq!(connectivity_events(Some(3), online(4)), vec![SyncEvent::Online]);
    assert_eq!(
      connectivity_events(Some(2), online(4)),
      vec![SyncEvent::Offline, SyncEvent::Online]
    );
  }

  #[tokio::test]
  async fn test_start_only_once() {
    let h = harness(NetworkState::Offline);
    assert!(h.layer.start().is_some());
    assert!(h.layer.start().is_none());
  }
}
