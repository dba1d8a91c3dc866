//! Redistribution source lifecycle.
//!
//! A [`Manager`] is created when this node is told to move shards out. It
//! opens one [`OutboundProcessor`] per target node and one [`Replicator`] per
//! outgoing shard, then runs passes over the shards in a background task:
//! finished shards are skipped, aborted shards resume from their persisted
//! micro-shard, the rest are streamed from the start. Live writes reach the
//! same replicators through [`Manager::forward`].

use crate::config::RedistConfig;
use crate::coord::{keys, CoordinationStore};
use crate::error::{Error, Result};
use crate::redist::outbound::{OutboundProcessor, TargetConnector};
use crate::redist::replicator::Replicator;
use crate::redist::stats::{SnapshotStatus, Stats};
use crate::types::{NodeId, OperationalMessage, ShardId, ZoneId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Streams a shard's point-in-time contents to a replicator.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Returns whether the shard was streamed completely.
    async fn replicate_snapshot(
        &self,
        shard_id: ShardId,
        rb: &Replicator,
        start_micro_shard: i32,
    ) -> bool;
}

/// Moves this node's outgoing shards to their new owners.
pub struct Manager {
    zone_id: ZoneId,
    node_id: NodeId,
    replicators: BTreeMap<ShardId, Arc<Replicator>>,
    processors: Vec<Arc<OutboundProcessor>>,
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn CoordinationStore>,
    config: Arc<RedistConfig>,
    stop: CancellationToken,
    done: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Connect to the targets named in `change_map` and start the first run.
    ///
    /// `conn_info` holds the address of every node in the zone, indexed by
    /// node id.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        zone_id: ZoneId,
        node_id: NodeId,
        conn_info: &[String],
        change_map: &BTreeMap<ShardId, NodeId>,
        config: Arc<RedistConfig>,
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn SnapshotSource>,
        connector: &dyn TargetConnector,
        rate_limit_kbps: u64,
    ) -> Result<Arc<Self>> {
        let stop = CancellationToken::new();
        let mut by_node: BTreeMap<NodeId, Arc<OutboundProcessor>> = BTreeMap::new();
        let mut replicators = BTreeMap::new();

        for (&shard_id, &target) in change_map {
            let addr = conn_info
                .get(target as usize)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "change map sends shard {} to unknown node {}",
                        shard_id, target
                    ))
                })?;

            let processor = match by_node.get(&target) {
                Some(p) => p.clone(),
                None => {
                    let p = OutboundProcessor::start(connector.connect(addr, &config.outbound), &config);
                    by_node.insert(target, p.clone());
                    p
                }
            };

            let rb = Replicator::new(
                shard_id,
                Some(processor),
                keys::redist_state_key(zone_id, node_id, shard_id),
                rate_limit_kbps,
                store.clone(),
                config.clone(),
                stop.child_token(),
            );
            replicators.insert(shard_id, Arc::new(rb));
        }

        info!(
            zone_id,
            node_id,
            shards = replicators.len(),
            targets = by_node.len(),
            "Redistribution manager created"
        );

        let manager = Arc::new(Self {
            zone_id,
            node_id,
            replicators,
            processors: by_node.into_values().collect(),
            source,
            store,
            config,
            stop,
            done: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        manager.spawn_run();
        Ok(manager)
    }

    fn spawn_run(self: &Arc<Self>) {
        self.done.store(false, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run().await;
            this.done.store(true, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);
    }

    async fn run(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.start_delay) => {}
            _ = self.stop.cancelled() => return,
        }

        let total = self.replicators.len();
        for round in 0..self.config.max_rounds {
            let mut finished = 0;
            for rb in self.replicators.values() {
                if self.is_stopped() {
                    break;
                }
                if self.run_shard(rb).await {
                    finished += 1;
                }
            }
            if finished == total {
                info!(node_id = self.node_id, shards = total, "Redistribution finished");
                return;
            }
            if self.is_stopped() {
                info!(node_id = self.node_id, "Redistribution stopped");
                return;
            }
            debug!(round, finished, total, "Redistribution round incomplete");
        }
        warn!(node_id = self.node_id, "Redistribution aborted, too many errors");
    }

    async fn persisted_stats(&self, rb: &Replicator) -> Option<Stats> {
        match self.store.get_value(rb.stats_key()).await {
            Ok(Some(value)) => Some(Stats::parse(&value)),
            Ok(None) => None,
            Err(e) => {
                debug!(shard_id = rb.shard_id(), error = %e, "Cannot read redistribution state");
                None
            }
        }
    }

    /// Stream one shard unless already finished. Returns whether it finished.
    async fn run_shard(&self, rb: &Replicator) -> bool {
        let shard_id = rb.shard_id();
        let mut start_micro_shard = 0;

        if let Some(persisted) = self.persisted_stats(rb).await {
            match persisted.status() {
                SnapshotStatus::Finished => {
                    info!(shard_id, "Shard already redistributed, skipping");
                    return true;
                }
                SnapshotStatus::Aborted => {
                    rb.restore_snapshot_state(&persisted);
                    start_micro_shard = persisted.micro_shard_id();
                    if start_micro_shard != 0 {
                        start_micro_shard += 1;
                    }
                    info!(shard_id, start_micro_shard, "Resuming aborted shard");
                }
                _ => {}
            }
        }

        rb.snapshot_stats().set_status(SnapshotStatus::Begin);
        rb.log_stats(Instant::now(), true, false).await;

        self.source
            .replicate_snapshot(shard_id, rb, start_micro_shard)
            .await;

        matches!(
            self.persisted_stats(rb).await.map(|s| s.status()),
            Some(SnapshotStatus::Finished)
        )
    }

    /// Run again with a new rate limit. Ignored while a run is in progress.
    pub fn resume(self: &Arc<Self>, rate_limit_kbps: u64) -> bool {
        if !self.is_done() {
            info!(node_id = self.node_id, "Redistribution still running, resume ignored");
            return false;
        }
        if self.is_stopped() {
            return false;
        }
        for rb in self.replicators.values() {
            rb.set_rate_limit_kbps(rate_limit_kbps);
        }
        info!(node_id = self.node_id, rate_limit_kbps, "Redistribution resumed");
        self.spawn_run();
        true
    }

    /// Stop the run, wait for it to exit and close the target connections.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for processor in &self.processors {
            processor.shutdown().await;
        }
        info!(zone_id = self.zone_id, node_id = self.node_id, "Redistribution manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Whether the last run has exited.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Mirror a live write to the shard's replicator. No-op for shards not
    /// being moved, and for aborted shards until the next pass or resume.
    pub fn forward(&self, shard_id: ShardId, msg: OperationalMessage) {
        let Some(rb) = self.replicators.get(&shard_id) else {
            return;
        };
        if rb.snapshot_stats().status() == SnapshotStatus::Aborted {
            debug!(shard_id, "Shard aborted, realtime forward skipped");
            return;
        }
        if let Err(e) = rb.send_request(msg, true, true) {
            debug!(shard_id, error = %e, "Realtime forward failed");
        }
    }

    pub fn replicator(&self, shard_id: ShardId) -> Option<&Arc<Replicator>> {
        self.replicators.get(&shard_id)
    }

    pub fn shards(&self) -> Vec<ShardId> {
        self.replicators.keys().copied().collect()
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("zone_id", &self.zone_id)
            .field("node_id", &self.node_id)
            .field("shards", &self.shards())
            .field("done", &self.is_done())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::InMemoryCoordStore;
    use crate::testing::utils::{MockConnector, MockTarget};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts calls and persists a fixed status.
    struct ScriptedSource {
        calls: AtomicUsize,
        starts: Mutex<Vec<(ShardId, i32)>>,
        status: SnapshotStatus,
    }

    impl ScriptedSource {
        fn new(status: SnapshotStatus) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
                status,
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn replicate_snapshot(&self, shard_id: ShardId, rb: &Replicator, start: i32) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().push((shard_id, start));
            rb.snapshot_stats().set_status(self.status);
            rb.log_stats(Instant::now(), true, false).await;
            self.status == SnapshotStatus::Finished
        }
    }

    fn config() -> Arc<RedistConfig> {
        let mut cfg = RedistConfig::default().with_start_delay(Duration::from_millis(1));
        cfg.max_rounds = 3;
        Arc::new(cfg)
    }

    fn conn_info() -> Vec<String> {
        vec!["10.0.0.1:1".to_string(), "10.0.0.2:1".to_string()]
    }

    async fn wait_done(m: &Manager) {
        for _ in 0..200 {
            if m.is_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("manager did not finish");
    }

    #[tokio::test]
    async fn test_unknown_target_node_rejected() {
        let change_map = BTreeMap::from([(3, 5)]);
        let result = Manager::start(
            1,
            0,
            &conn_info(),
            &change_map,
            config(),
            Arc::new(InMemoryCoordStore::new()),
            ScriptedSource::new(SnapshotStatus::Finished),
            &MockConnector::new(MockTarget::new()),
            0,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_finishes_all_shards() {
        let store = Arc::new(InMemoryCoordStore::new());
        let source = ScriptedSource::new(SnapshotStatus::Finished);
        let change_map = BTreeMap::from([(3, 1), (4, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), store.clone(), source.clone(),
            &MockConnector::new(MockTarget::new()), 0,
        )
        .unwrap();
        wait_done(&m).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let persisted = store.get_value("redist_state_01_000_00003").await.unwrap().unwrap();
        assert!(persisted.starts_with("st=F"));
        m.stop().await;
    }

    #[tokio::test]
    async fn test_finished_shards_are_skipped() {
        let store = Arc::new(InMemoryCoordStore::new());
        store.put("redist_state_01_000_00003", "st=F&total=1&ok=1").await.unwrap();
        let source = ScriptedSource::new(SnapshotStatus::Finished);
        let change_map = BTreeMap::from([(3, 1), (4, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), store, source.clone(),
            &MockConnector::new(MockTarget::new()), 0,
        )
        .unwrap();
        wait_done(&m).await;
        assert_eq!(*source.starts.lock(), vec![(4, 0)]);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_aborted_shard_resumes_after_checkpoint() {
        let store = Arc::new(InMemoryCoordStore::new());
        store
            .put("redist_state_01_000_00003", "st=A&total=10&ok=10&mshd=7")
            .await
            .unwrap();
        let source = ScriptedSource::new(SnapshotStatus::Finished);
        let change_map = BTreeMap::from([(3, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), store, source.clone(),
            &MockConnector::new(MockTarget::new()), 0,
        )
        .unwrap();
        wait_done(&m).await;
        assert_eq!(*source.starts.lock(), vec![(3, 8)]);
        assert_eq!(m.replicator(3).unwrap().snapshot_stats().total(), 10);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_rounds_and_resumes() {
        let store = Arc::new(InMemoryCoordStore::new());
        let source = ScriptedSource::new(SnapshotStatus::InProgress);
        let change_map = BTreeMap::from([(3, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), store, source.clone(),
            &MockConnector::new(MockTarget::new()), 0,
        )
        .unwrap();
        wait_done(&m).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        assert!(m.resume(500));
        wait_done(&m).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 6);
        assert_eq!(m.replicator(3).unwrap().rate_limit_kbps(), 500);
        m.stop().await;
        assert!(!m.resume(500));
    }

    #[tokio::test]
    async fn test_forward_goes_to_shard_replicator() {
        let target = MockTarget::new();
        let source = ScriptedSource::new(SnapshotStatus::Finished);
        let change_map = BTreeMap::from([(3, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), Arc::new(InMemoryCoordStore::new()),
            source, &MockConnector::new(target.clone()), 0,
        )
        .unwrap();

        let msg = OperationalMessage::request(
            crate::types::OpCode::Clone,
            "ns",
            "k",
            crate::types::RequestId::new(),
        );
        m.forward(9, msg.clone());
        m.forward(3, msg);
        for _ in 0..100 {
            if target.sent_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(target.sent_count(), 1);
        assert_eq!(m.replicator(3).unwrap().realtime_stats().total(), 1);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_aborted_shard_is_not_forwarded() {
        let target = MockTarget::new();
        let source = ScriptedSource::new(SnapshotStatus::Aborted);
        let change_map = BTreeMap::from([(3, 1)]);
        let m = Manager::start(
            1, 0, &conn_info(), &change_map, config(), Arc::new(InMemoryCoordStore::new()),
            source, &MockConnector::new(target.clone()), 0,
        )
        .unwrap();
        wait_done(&m).await;
        assert_eq!(m.replicator(3).unwrap().snapshot_stats().status(), SnapshotStatus::Aborted);

        let msg = OperationalMessage::request(
            crate::types::OpCode::Clone,
            "ns",
            "k",
            crate::types::RequestId::new(),
        );
        m.forward(3, msg);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.sent_count(), 0);
        assert_eq!(m.replicator(3).unwrap().realtime_stats().total(), 0);
        m.stop().await;
    }
}
