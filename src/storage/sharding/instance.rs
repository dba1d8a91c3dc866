//! One engine per shard.

use super::Sharding;
use crate::error::{Result, StorageError};
use crate::redist::snapshot::{rate_limiter_for, send_with_retry, wait_for_finish};
use crate::redist::{Replicator, SnapshotStatus};
use crate::storage::engine::{EngineFactory, EngineSnapshot, KvEngine};
use crate::storage::record::Record;
use crate::storage::record_key::{decode_without_prefix, RecordKey};
use crate::types::ShardId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Engine name for a shard.
fn engine_name(shard_id: ShardId) -> String {
    format!("shard-{:05}", shard_id)
}

/// Each owned shard gets its own engine. Keys carry no shard prefix.
pub struct InstanceSharding {
    factory: Arc<dyn EngineFactory>,
    engines: RwLock<BTreeMap<ShardId, Arc<dyn KvEngine>>>,
}

impl InstanceSharding {
    /// Open an engine for every shard in `shards`.
    pub fn open(factory: Arc<dyn EngineFactory>, shards: &BTreeSet<ShardId>) -> Result<Self> {
        let mut engines = BTreeMap::new();
        for &shard_id in shards {
            engines.insert(shard_id, factory.open(&engine_name(shard_id))?);
        }
        info!(shards = engines.len(), "Opened shard engines");
        Ok(Self {
            factory,
            engines: RwLock::new(engines),
        })
    }

    fn engine(&self, shard_id: ShardId) -> Result<Arc<dyn KvEngine>> {
        self.engines
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StorageError::ShardNotFound(shard_id).into())
    }

    /// Shards with an open engine.
    pub fn shards(&self) -> Vec<ShardId> {
        self.engines.read().keys().copied().collect()
    }

    async fn stream(
        &self,
        shard_id: ShardId,
        snapshot: &dyn EngineSnapshot,
        rb: &Replicator,
        start: Instant,
    ) -> bool {
        let mut limiter = rate_limiter_for(rb);
        let mut count = 0u64;
        let mut skipped = 0u64;

        for entry in snapshot.iter_from(&[]) {
            let (raw_key, raw_value) = match entry {
                Ok(kv) => kv,
                Err(e) => {
                    debug!(shard_id, error = %e, "Skipping unreadable entry");
                    skipped += 1;
                    rb.snapshot_stats().incr_skipped();
                    continue;
                }
            };
            let Ok((namespace, key)) = decode_without_prefix(&raw_key) else {
                debug!(shard_id, "Skipping undecodable key");
                skipped += 1;
                rb.snapshot_stats().incr_skipped();
                continue;
            };
            let Ok(rec) = Record::decode(&raw_value) else {
                debug!(shard_id, "Skipping undecodable record");
                skipped += 1;
                rb.snapshot_stats().incr_skipped();
                continue;
            };
            if rec.is_expired() {
                debug!(shard_id, "Snapshot record expired, skipping");
                rb.snapshot_stats().incr_expired();
                continue;
            }

            limiter
                .get_token((raw_key.len() + raw_value.len()) as u64)
                .await;

            let msg = rec.to_clone_message(shard_id, &namespace, &key);
            if send_with_retry(rb, msg).await.is_err() {
                info!(shard_id, "Target not available, aborting shard redistribution");
                return false;
            }
            count += 1;

            if rb.is_stopped() {
                info!(shard_id, "Snapshot replication aborted");
                return false;
            }
        }

        debug!(shard_id, count, skipped, elapsed = ?start.elapsed(), "Snapshot records forwarded");
        wait_for_finish(rb).await
    }
}

impl std::fmt::Debug for InstanceSharding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSharding")
            .field("shards", &self.shards())
            .finish()
    }
}

#[async_trait]
impl Sharding for InstanceSharding {
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<()> {
        self.engine(key.shard_id())?.put(key.without_prefix(), value)
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Bytes>> {
        self.engine(key.shard_id())?.get(key.without_prefix())
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        self.engine(key.shard_id())?.delete(key.without_prefix())
    }

    async fn replicate_snapshot(
        &self,
        shard_id: ShardId,
        rb: &Replicator,
        _start_micro_shard: i32,
    ) -> bool {
        let snapshot = match self.engine(shard_id).and_then(|e| e.snapshot()) {
            Ok(s) => s,
            Err(e) => {
                error!(shard_id, error = %e, "Cannot snapshot shard");
                return false;
            }
        };

        let start = Instant::now();
        rb.snapshot_stats().set_status(SnapshotStatus::InProgress);
        let drained = self.stream(shard_id, snapshot.as_ref(), rb, start).await;
        if drained {
            rb.snapshot_stats().set_status(SnapshotStatus::Finished);
        } else {
            info!(shard_id, "Snapshot not drained, rolling back to last checkpoint");
        }
        // An undrained shard is persisted as aborted so the next round resumes it.
        let aborted = rb.log_stats(start, true, !drained).await;
        drained && !aborted
    }

    fn update_shards(&self, shards: &BTreeSet<ShardId>) -> Result<Box<dyn Sharding>> {
        let current = self.engines.read();
        let mut engines = BTreeMap::new();
        for &shard_id in shards {
            let engine = match current.get(&shard_id) {
                Some(engine) => engine.clone(),
                None => {
                    info!(shard_id, "Opening engine for new shard");
                    self.factory.open(&engine_name(shard_id))?
                }
            };
            engines.insert(shard_id, engine);
        }
        Ok(Box::new(Self {
            factory: self.factory.clone(),
            engines: RwLock::new(engines),
        }))
    }

    fn compact_shards(&self, shards: &[ShardId]) {
        let mut engines = self.engines.write();
        for shard_id in shards {
            if engines.remove(shard_id).is_some() {
                info!(shard_id, "Closed shard engine");
            }
        }
    }

    fn shutdown(&self) {
        let closed = std::mem::take(&mut *self.engines.write());
        info!(shards = closed.len(), "Shard engines shut down");
    }

    fn get_property(&self, name: &str) -> u64 {
        self.engines
            .read()
            .values()
            .filter_map(|e| e.property(name))
            .filter_map(|v| v.parse::<u64>().ok())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedistConfig;
    use crate::coord::{CoordinationStore, InMemoryCoordStore};
    use crate::error::Error;
    use crate::storage::engine::{MemoryEngineFactory, PROP_NUM_KEYS};
    use crate::redist::{OutboundProcessor, ReplicationTarget, Stats};
    use crate::storage::record_key::KeyLayout;
    use crate::testing::utils::{replicator_for, sample_record, MockTarget};
    use crate::types::{now_secs, OperationalMessage};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Accepts messages and never replies.
    struct StalledTarget;

    #[async_trait]
    impl ReplicationTarget for StalledTarget {
        async fn send(&self, _msg: &OperationalMessage) -> Result<OperationalMessage> {
            std::future::pending::<Result<OperationalMessage>>().await
        }

        fn addr(&self) -> &str {
            "stalled"
        }
    }

    fn put_live(sharding: &InstanceSharding, shard_id: ShardId, n: u32) {
        let layout = KeyLayout::new(false);
        for i in 0..n {
            let key = layout.record_key(shard_id, 0, b"ns", format!("live{}", i).as_bytes());
            sharding.put(&key, &sample_record(now_secs() + 3600).encode()).unwrap();
        }
    }

    async fn persisted(store: &InMemoryCoordStore, rb: &Replicator) -> Stats {
        Stats::parse(&store.get_value(rb.stats_key()).await.unwrap().unwrap())
    }

    fn shards(ids: &[ShardId]) -> BTreeSet<ShardId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_put_get_per_shard() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[1, 2])).unwrap();
        let layout = KeyLayout::new(false);
        let k1 = layout.record_key(1, 0, b"ns", b"a");
        let k2 = layout.record_key(2, 0, b"ns", b"a");
        sharding.put(&k1, b"one").unwrap();
        assert_eq!(sharding.get(&k1).unwrap().unwrap().as_ref(), b"one");
        assert!(sharding.get(&k2).unwrap().is_none());
        assert_eq!(sharding.get_property(PROP_NUM_KEYS), 1);

        let k9 = layout.record_key(9, 0, b"ns", b"a");
        assert!(matches!(
            sharding.put(&k9, b"x"),
            Err(Error::Storage(StorageError::ShardNotFound(9)))
        ));
    }

    #[test]
    fn test_update_shards_reuses_engines() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[1, 2])).unwrap();
        let key = KeyLayout::new(false).record_key(2, 0, b"ns", b"k");
        sharding.put(&key, b"v").unwrap();

        let next = sharding.update_shards(&shards(&[2, 3])).unwrap();
        assert!(next.get(&key).unwrap().is_some());
        sharding.compact_shards(&[1]);
        assert_eq!(sharding.shards(), vec![2]);
    }

    #[tokio::test]
    async fn test_replicate_snapshot_skips_expired() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[4])).unwrap();
        let layout = KeyLayout::new(false);
        for i in 0..5u32 {
            let key = layout.record_key(4, 0, b"ns", format!("live{}", i).as_bytes());
            sharding.put(&key, &sample_record(now_secs() + 3600).encode()).unwrap();
        }
        for i in 0..2u32 {
            let key = layout.record_key(4, 0, b"ns", format!("gone{}", i).as_bytes());
            sharding.put(&key, &sample_record(now_secs() - 10).encode()).unwrap();
        }

        let store = Arc::new(InMemoryCoordStore::new());
        let target = MockTarget::new();
        let (rb, proc) = replicator_for(4, target.clone(), store.clone(), RedistConfig::default());

        assert!(sharding.replicate_snapshot(4, &rb, 0).await);
        assert_eq!(target.sent_count(), 5);
        assert_eq!(rb.snapshot_stats().ok(), 5);
        assert_eq!(rb.snapshot_stats().expired(), 2);

        let persisted = store.get_value(rb.stats_key()).await.unwrap().unwrap();
        assert!(persisted.starts_with("st=F&total=5&ok=5"));
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_undrained_snapshot_is_not_finished() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[4])).unwrap();
        put_live(&sharding, 4, 3);

        let store = Arc::new(InMemoryCoordStore::new());
        let config = RedistConfig::default().with_max_wait_time(Duration::from_millis(100));
        let (rb, proc) = replicator_for(4, Arc::new(StalledTarget), store.clone(), config);

        assert!(!sharding.replicate_snapshot(4, &rb, 0).await);
        assert_eq!(rb.snapshot_stats().ok(), 0);

        // Rolled back to the empty checkpoint so the next round starts over.
        let stats = persisted(&store, &rb).await;
        assert_eq!(stats.status(), SnapshotStatus::Aborted);
        assert_eq!(stats.total(), 0);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_snapshot_is_aborted() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[4])).unwrap();
        put_live(&sharding, 4, 5);

        let store = Arc::new(InMemoryCoordStore::new());
        let config = Arc::new(RedistConfig::default());
        let processor = OutboundProcessor::start(MockTarget::new(), &config);
        let stop = CancellationToken::new();
        let rb = Replicator::new(
            4,
            Some(processor.clone()),
            "redist/4".to_string(),
            0,
            store.clone(),
            config,
            stop.clone(),
        );
        stop.cancel();

        assert!(!sharding.replicate_snapshot(4, &rb, 0).await);
        let stats = persisted(&store, &rb).await;
        assert_eq!(stats.status(), SnapshotStatus::Aborted);
        assert!(!stats.is_finished());
        assert_eq!(stats.total(), 0);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_undecodable_record_is_counted() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[4])).unwrap();
        put_live(&sharding, 4, 2);
        let bad = KeyLayout::new(false).record_key(4, 0, b"ns", b"corrupt");
        sharding.put(&bad, b"not a record").unwrap();

        let store = Arc::new(InMemoryCoordStore::new());
        let target = MockTarget::new();
        let (rb, proc) = replicator_for(4, target.clone(), store.clone(), RedistConfig::default());

        assert!(sharding.replicate_snapshot(4, &rb, 0).await);
        assert_eq!(rb.snapshot_stats().skipped(), 1);
        assert_eq!(target.sent_count(), 2);

        let stats = persisted(&store, &rb).await;
        assert_eq!(stats.status(), SnapshotStatus::Finished);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.ok(), 2);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicate_missing_shard() {
        let sharding = InstanceSharding::open(Arc::new(MemoryEngineFactory::new()), &shards(&[1])).unwrap();
        let (rb, proc) = replicator_for(
            7,
            MockTarget::new(),
            Arc::new(InMemoryCoordStore::new()),
            RedistConfig::default(),
        );
        assert!(!sharding.replicate_snapshot(7, &rb, 0).await);
        proc.shutdown().await;
    }
}
