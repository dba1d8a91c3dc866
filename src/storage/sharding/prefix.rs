//! Shards spread over a fixed set of engines by key prefix.

use super::{MicroShardGroup, Sharding};
use crate::config::MicroShardConfig;
use crate::error::{Result, StorageError};
use crate::redist::snapshot::{rate_limiter_for, send_with_retry, wait_for_finish};
use crate::redist::Replicator;
use crate::storage::engine::{EngineFactory, EngineSnapshot, KvEngine};
use crate::storage::record::Record;
use crate::storage::record_key::{KeyLayout, RecordKey};
use crate::types::ShardId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// `num_dbs` engines shared by all shards. Keys keep their shard prefix, so
/// each shard is the contiguous range starting with its big-endian id.
pub struct PrefixSharding {
    layout: KeyLayout,
    micro: MicroShardConfig,
    dbs: RwLock<Vec<Arc<dyn KvEngine>>>,
}

impl PrefixSharding {
    pub fn open(factory: &dyn EngineFactory, num_dbs: u32, micro: MicroShardConfig) -> Result<Self> {
        let mut dbs = Vec::with_capacity(num_dbs.max(1) as usize);
        for i in 0..num_dbs.max(1) {
            dbs.push(factory.open(&format!("db-{}", i))?);
        }
        info!(num_dbs = dbs.len(), micro_shards = micro.num_micro_shards, "Opened prefix engines");
        Ok(Self {
            layout: KeyLayout::new(micro.enabled),
            micro,
            dbs: RwLock::new(dbs),
        })
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    fn db(&self, shard_id: ShardId) -> Result<Arc<dyn KvEngine>> {
        let dbs = self.dbs.read();
        if dbs.is_empty() {
            return Err(StorageError::Closed.into());
        }
        Ok(dbs[shard_id as usize % dbs.len()].clone())
    }

    async fn stream(
        &self,
        shard_id: ShardId,
        snapshot: &dyn EngineSnapshot,
        rb: &Replicator,
        start_micro_shard: i32,
    ) -> bool {
        let num_micro = self.micro.num_micro_shards;
        let num_groups = self.micro.num_micro_shard_groups;
        let per_group = if num_groups > 0 {
            num_micro / num_groups
        } else {
            num_micro
        };
        let mut group_num = 0;
        let mut group = MicroShardGroup::new(num_micro, per_group, group_num);
        let mut limiter = rate_limiter_for(rb);
        let prefix = shard_id.to_be_bytes();
        let start = Instant::now();

        for entry in snapshot.iter_from(&prefix) {
            let (raw_key, raw_value) = match entry {
                Ok(kv) => kv,
                Err(e) => {
                    debug!(shard_id, error = %e, "Skipping unreadable entry");
                    group.errors += 1;
                    rb.snapshot_stats().incr_skipped();
                    continue;
                }
            };
            if !raw_key.starts_with(&prefix) {
                break;
            }

            if num_micro > 0 {
                let Some(&micro) = raw_key.get(2) else {
                    group.errors += 1;
                    rb.snapshot_stats().incr_skipped();
                    continue;
                };
                let micro = micro as u32;
                if (micro as i32) < start_micro_shard {
                    continue;
                }
                if micro >= num_micro {
                    group.errors += 1;
                    rb.snapshot_stats().incr_skipped();
                    continue;
                }
                while micro > group.end_id {
                    let drained = wait_for_finish(rb).await;
                    if group.log_stats(shard_id, rb, drained).await {
                        return false;
                    }
                    group_num += 1;
                    group.reset(num_micro, per_group, group_num);
                }
            }

            let Ok((namespace, key)) = self.layout.decode(&raw_key) else {
                group.errors += 1;
                rb.snapshot_stats().incr_skipped();
                continue;
            };
            let Ok(rec) = Record::decode(&raw_value) else {
                group.errors += 1;
                rb.snapshot_stats().incr_skipped();
                continue;
            };
            if rec.is_expired() {
                group.expired += 1;
                rb.snapshot_stats().incr_expired();
                continue;
            }

            limiter
                .get_token((raw_key.len() + raw_value.len()) as u64)
                .await;

            let msg = rec.to_clone_message(shard_id, &namespace, &key);
            if send_with_retry(rb, msg).await.is_err() {
                rb.log_stats(start, true, true).await;
                info!(shard_id, "Target not available, aborting shard redistribution");
                return false;
            }
            group.keys += 1;

            if rb.is_stopped() {
                info!(shard_id, "Snapshot replication aborted");
                return false;
            }
        }

        let drained = wait_for_finish(rb).await;
        if group.log_stats(shard_id, rb, drained).await {
            return false;
        }
        // Groups past the last key are empty but still checkpointed.
        while group_num + 1 < num_groups {
            group_num += 1;
            group.reset(num_micro, per_group, group_num);
            group.log_stats(shard_id, rb, true).await;
        }
        true
    }
}

impl std::fmt::Debug for PrefixSharding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixSharding")
            .field("num_dbs", &self.dbs.read().len())
            .field("micro", &self.micro)
            .finish()
    }
}

#[async_trait]
impl Sharding for PrefixSharding {
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<()> {
        self.db(key.shard_id())?.put(key.full(), value)
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Bytes>> {
        self.db(key.shard_id())?.get(key.full())
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        self.db(key.shard_id())?.delete(key.full())
    }

    async fn replicate_snapshot(
        &self,
        shard_id: ShardId,
        rb: &Replicator,
        start_micro_shard: i32,
    ) -> bool {
        let snapshot = match self.db(shard_id).and_then(|db| db.snapshot()) {
            Ok(s) => s,
            Err(e) => {
                error!(shard_id, error = %e, "Cannot snapshot shard");
                return false;
            }
        };
        self.stream(shard_id, snapshot.as_ref(), rb, start_micro_shard)
            .await
    }

    fn update_shards(&self, _shards: &BTreeSet<ShardId>) -> Result<Box<dyn Sharding>> {
        Ok(Box::new(Self {
            layout: self.layout,
            micro: self.micro,
            dbs: RwLock::new(self.dbs.read().clone()),
        }))
    }

    fn compact_shards(&self, shards: &[ShardId]) {
        for &shard_id in shards {
            let db = match self.db(shard_id) {
                Ok(db) => db,
                Err(_) => return,
            };
            let start = shard_id.to_be_bytes();
            let end = shard_id.checked_add(1).map(|next| next.to_be_bytes());
            match db.compact_range(&start, end.as_ref().map(|e| &e[..])) {
                Ok(()) => info!(shard_id, "Compacted shard range"),
                Err(e) => warn!(shard_id, error = %e, "Failed to compact shard range"),
            }
        }
    }

    fn shutdown(&self) {
        let closed = std::mem::take(&mut *self.dbs.write());
        info!(num_dbs = closed.len(), "Prefix engines shut down");
    }

    fn get_property(&self, name: &str) -> u64 {
        self.dbs
            .read()
            .iter()
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
    use crate::redist::{SnapshotStatus, Stats};
    use crate::storage::engine::MemoryEngineFactory;
    use crate::testing::utils::{replicator_for, sample_record, MockTarget};
    use crate::types::now_secs;

    fn open(num_dbs: u32, micro: MicroShardConfig) -> PrefixSharding {
        PrefixSharding::open(&MemoryEngineFactory::new(), num_dbs, micro).unwrap()
    }

    fn put_live(s: &PrefixSharding, shard: ShardId, micro: u8, key: &str) {
        let rk = s.layout().record_key(shard, micro, b"ns", key.as_bytes());
        s.put(&rk, &sample_record(now_secs() + 3600).encode()).unwrap();
    }

    #[test]
    fn test_shards_share_engines() {
        let s = open(2, MicroShardConfig::default());
        let a = s.layout().record_key(1, 0, b"ns", b"k");
        let b = s.layout().record_key(3, 0, b"ns", b"k");
        s.put(&a, b"v1").unwrap();
        s.put(&b, b"v3").unwrap();
        assert_eq!(s.get(&a).unwrap().unwrap().as_ref(), b"v1");
        assert_eq!(s.get(&b).unwrap().unwrap().as_ref(), b"v3");
        assert_eq!(s.db(1).unwrap().property(crate::storage::PROP_NUM_KEYS).as_deref(), Some("2"));
    }

    #[test]
    fn test_compact_shards_only_touches_given_range() {
        let s = open(1, MicroShardConfig::default());
        put_live(&s, 5, 0, "a");
        put_live(&s, 6, 0, "b");
        put_live(&s, u16::MAX, 0, "c");
        s.compact_shards(&[5, u16::MAX]);

        assert!(s.get(&s.layout().record_key(5, 0, b"ns", b"a")).unwrap().is_none());
        assert!(s.get(&s.layout().record_key(6, 0, b"ns", b"b")).unwrap().is_some());
        assert!(s.get(&s.layout().record_key(u16::MAX, 0, b"ns", b"c")).unwrap().is_none());
    }

    #[test]
    fn test_shutdown_closes_engines() {
        let s = open(1, MicroShardConfig::default());
        s.shutdown();
        let key = s.layout().record_key(1, 0, b"ns", b"k");
        assert!(s.get(&key).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_stays_within_shard() {
        let s = open(1, MicroShardConfig::default());
        for i in 0..3 {
            put_live(&s, 2, 0, &format!("k{}", i));
        }
        put_live(&s, 3, 0, "other");
        let expired = s.layout().record_key(2, 0, b"ns", b"old");
        s.put(&expired, &sample_record(now_secs() - 5).encode()).unwrap();

        let target = MockTarget::new();
        let store = Arc::new(InMemoryCoordStore::new());
        let (rb, proc) = replicator_for(2, target.clone(), store.clone(), RedistConfig::default());
        assert!(s.replicate_snapshot(2, &rb, 0).await);

        let sent = target.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.shard_id == 2 && m.namespace.as_ref() == b"ns"));
        assert_eq!(rb.snapshot_stats().expired(), 1);
        let persisted = store.get_value(rb.stats_key()).await.unwrap().unwrap();
        assert!(persisted.starts_with("st=F&total=3&ok=3"));
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_micro_shard_groups_checkpoint_progress() {
        let s = open(1, MicroShardConfig::enabled(8, 4));
        for micro in [0u8, 1, 3, 6] {
            put_live(&s, 1, micro, &format!("m{}", micro));
        }

        let target = MockTarget::new();
        let store = Arc::new(InMemoryCoordStore::new());
        let (rb, proc) = replicator_for(1, target.clone(), store.clone(), RedistConfig::default());

        let mut watch = store.watch(rb.stats_key());
        assert!(s.replicate_snapshot(1, &rb, 0).await);
        assert_eq!(target.sent_count(), 4);

        let mut statuses = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), watch.next()).await
        {
            if let crate::coord::WatchEvent::Put { value, .. } = event {
                let stats = Stats::parse(&value);
                statuses.push((stats.status(), stats.micro_shard_id()));
            }
        }
        assert_eq!(
            statuses,
            vec![
                (SnapshotStatus::InProgress, 1),
                (SnapshotStatus::InProgress, 3),
                (SnapshotStatus::InProgress, 5),
                (SnapshotStatus::Finished, 7),
            ]
        );
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_skips_completed_micro_shards() {
        let s = open(1, MicroShardConfig::enabled(8, 4));
        for micro in 0u8..8 {
            put_live(&s, 1, micro, &format!("m{}", micro));
        }
        let target = MockTarget::new();
        let (rb, proc) = replicator_for(
            1,
            target.clone(),
            Arc::new(InMemoryCoordStore::new()),
            RedistConfig::default(),
        );
        assert!(s.replicate_snapshot(1, &rb, 4).await);
        assert_eq!(target.sent_count(), 4);
        assert_eq!(rb.snapshot_stats().status(), SnapshotStatus::Finished);
        proc.shutdown().await;
    }
}
