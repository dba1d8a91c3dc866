//! Storage context shared by the request path and redistribution.
//!
//! [`Database`] owns the active [`Sharding`] strategy together with the set of
//! shards this node serves. When shard ownership changes a new strategy is
//! built from the current one and swapped in; requests already holding the
//! old handle finish against it before the removed shards are released.

use crate::config::{NodeConfig, ShardingKind};
use crate::error::Result;
use crate::redist::{Replicator, SnapshotSource};
use crate::storage::engine::{EngineFactory, MemoryEngineFactory};
use crate::storage::record::Record;
use crate::storage::record_key::{KeyLayout, RecordKey};
use crate::storage::sharding::{InstanceSharding, PrefixSharding, Sharding};
use crate::types::{MicroShardId, ShardId};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Record storage for the shards this node owns or is receiving.
pub struct Database {
    layout: KeyLayout,
    num_shards: u32,
    num_micro_shards: u32,
    swap_grace: Duration,
    sharding: ArcSwap<Box<dyn Sharding>>,
    shards: RwLock<BTreeSet<ShardId>>,
    redist_shards: RwLock<BTreeSet<ShardId>>,
}

impl Database {
    /// Open storage for `config.shards` using engines from `factory`.
    pub fn open(config: &NodeConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let micro = config.micro_shards.normalized();
        let shards: BTreeSet<ShardId> = config.shards.iter().copied().collect();

        let sharding: Box<dyn Sharding> = match config.sharding {
            ShardingKind::ByInstance => Box::new(InstanceSharding::open(factory, &shards)?),
            ShardingKind::ByPrefix => {
                Box::new(PrefixSharding::open(factory.as_ref(), config.num_dbs, micro)?)
            }
        };
        info!(
            node_id = config.node_id,
            shards = shards.len(),
            sharding = ?config.sharding,
            "Storage opened"
        );

        Ok(Self {
            layout: KeyLayout::new(micro.enabled),
            num_shards: config.num_shards,
            num_micro_shards: micro.num_micro_shards,
            swap_grace: config.storage_swap_grace,
            sharding: ArcSwap::from_pointee(sharding),
            shards: RwLock::new(shards),
            redist_shards: RwLock::new(BTreeSet::new()),
        })
    }

    /// Storage backed by in-memory engines.
    pub fn in_memory(config: &NodeConfig) -> Result<Self> {
        Self::open(config, Arc::new(MemoryEngineFactory::new()))
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn num_micro_shards(&self) -> u32 {
        self.num_micro_shards
    }

    pub fn record_key(
        &self,
        shard_id: ShardId,
        micro_shard_id: MicroShardId,
        namespace: &[u8],
        key: &[u8],
    ) -> RecordKey {
        self.layout
            .record_key(shard_id, micro_shard_id, namespace, key)
    }

    pub fn get_record(&self, key: &RecordKey) -> Result<Option<Record>> {
        match self.sharding.load().get(key)? {
            Some(value) => Ok(Some(Record::decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Like [`get_record`](Self::get_record) but treats expired records as absent.
    pub fn get_live_record(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.get_record(key)?.filter(|rec| !rec.is_expired()))
    }

    pub fn put_record(&self, key: &RecordKey, rec: &mut Record) -> Result<()> {
        let value = rec.encode();
        self.sharding.load().put(key, &value)
    }

    pub fn delete_record(&self, key: &RecordKey) -> Result<()> {
        self.sharding.load().delete(key)
    }

    /// Whether requests for `shard_id` may be served here: the shard is owned,
    /// or it is being received through redistribution.
    pub fn shard_supported(&self, shard_id: ShardId) -> bool {
        self.shards.read().contains(&shard_id) || self.redist_shards.read().contains(&shard_id)
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.shards.read().clone()
    }

    pub fn redist_shards(&self) -> BTreeSet<ShardId> {
        self.redist_shards.read().clone()
    }

    /// Serve exactly `shards` from now on. Removed shards stop being
    /// supported before the handle is swapped and added shards only after,
    /// so a supported shard is always backed by the handle serving it. The
    /// previous handle is shut down once requests holding it have drained.
    pub async fn update_shards(&self, shards: BTreeSet<ShardId>) -> Result<()> {
        let old = self.sharding.load_full();
        let next = old.update_shards(&shards)?;

        let removed: Vec<ShardId> = {
            let mut owned = self.shards.write();
            let removed: Vec<ShardId> = owned.difference(&shards).copied().collect();
            owned.retain(|s| shards.contains(s));
            removed
        };
        self.sharding.store(Arc::new(next));
        *self.shards.write() = shards;
        info!(removed = ?removed, "Swapped storage handle");

        tokio::time::sleep(self.swap_grace).await;
        if !removed.is_empty() {
            old.compact_shards(&removed);
        }
        old.shutdown();
        Ok(())
    }

    /// Set the shards being received through redistribution. An empty set
    /// clears them; a non-empty set is ignored while another is active.
    pub fn update_redist_shards(&self, shards: BTreeSet<ShardId>) {
        let mut current = self.redist_shards.write();
        if shards.is_empty() {
            if !current.is_empty() {
                info!(shards = ?*current, "Cleared redistribution target shards");
            }
            current.clear();
            return;
        }
        if !current.is_empty() {
            warn!(
                current = ?*current,
                requested = ?shards,
                "Redistribution target shards already set, ignoring update"
            );
            return;
        }
        info!(shards = ?shards, "Set redistribution target shards");
        *current = shards;
    }

    /// Sum of an engine property over all engines.
    pub fn get_property(&self, name: &str) -> u64 {
        self.sharding.load().get_property(name)
    }

    pub fn shutdown(&self) {
        self.sharding.load().shutdown();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("sharding", &**self.sharding.load())
            .field("shards", &self.shards.read().len())
            .field("redist_shards", &*self.redist_shards.read())
            .finish()
    }
}

#[async_trait]
impl SnapshotSource for Database {
    async fn replicate_snapshot(
        &self,
        shard_id: ShardId,
        rb: &Replicator,
        start_micro_shard: i32,
    ) -> bool {
        let sharding = self.sharding.load_full();
        sharding
            .replicate_snapshot(shard_id, rb, start_micro_shard)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MicroShardConfig;
    use crate::storage::engine::PROP_NUM_KEYS;
    use crate::testing::utils::sample_record;
    use crate::types::now_secs;

    fn config(kind: ShardingKind) -> NodeConfig {
        NodeConfig::new(1, 0)
            .with_num_shards(16)
            .with_shards([1, 2, 3])
            .with_sharding(kind)
            .with_storage_swap_grace(Duration::from_millis(1))
    }

    #[test]
    fn test_record_round_trip_through_storage() {
        let db = Database::in_memory(&config(ShardingKind::ByPrefix)).unwrap();
        let key = db.record_key(2, 0, b"ns", b"k");
        let mut rec = sample_record(now_secs() + 60);
        db.put_record(&key, &mut rec).unwrap();

        let stored = db.get_record(&key).unwrap().unwrap();
        assert_eq!(stored, rec);
        db.delete_record(&key).unwrap();
        assert!(db.get_record(&key).unwrap().is_none());
    }

    #[test]
    fn test_micro_shard_layout() {
        let cfg = config(ShardingKind::ByPrefix).with_micro_shards(MicroShardConfig::enabled(16, 4));
        let db = Database::in_memory(&cfg).unwrap();
        assert_eq!(db.layout().prefix_len(), 3);
        assert_eq!(db.num_micro_shards(), 16);
    }

    #[test]
    fn test_redist_shards_extend_support() {
        let db = Database::in_memory(&config(ShardingKind::ByPrefix)).unwrap();
        assert!(!db.shard_supported(9));

        db.update_redist_shards([9, 10].into_iter().collect());
        assert!(db.shard_supported(9));

        // A second non-empty set is ignored until cleared.
        db.update_redist_shards([11].into_iter().collect());
        assert!(!db.shard_supported(11));

        db.update_redist_shards(BTreeSet::new());
        assert!(!db.shard_supported(9));
    }

    #[tokio::test]
    async fn test_update_shards_by_instance() {
        let db = Database::in_memory(&config(ShardingKind::ByInstance)).unwrap();
        let kept = db.record_key(2, 0, b"ns", b"kept");
        db.put_record(&kept, &mut sample_record(now_secs() + 60)).unwrap();

        db.update_shards([2, 4].into_iter().collect()).await.unwrap();
        assert!(db.shard_supported(4));
        assert!(!db.shard_supported(1));
        assert!(db.get_record(&kept).unwrap().is_some());

        let moved = db.record_key(1, 0, b"ns", b"x");
        assert!(db.get_record(&moved).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_added_shard_is_served_once_supported() {
        let db = Arc::new(Database::in_memory(&config(ShardingKind::ByInstance)).unwrap());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let db = db.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut checked = 0u64;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    for shard in 4..10 {
                        if db.shard_supported(shard) {
                            let key = db.record_key(shard, 0, b"ns", b"k");
                            assert!(db.get_record(&key).is_ok(), "shard {} not served", shard);
                            checked += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                checked
            })
        };

        for last in 4..10 {
            db.update_shards((1..=last).collect()).await.unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(reader.await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_old_handle_shutdown_keeps_shared_engines() {
        for kind in [ShardingKind::ByInstance, ShardingKind::ByPrefix] {
            let db = Database::in_memory(&config(kind)).unwrap();
            let kept = db.record_key(2, 0, b"ns", b"kept");
            db.put_record(&kept, &mut sample_record(now_secs() + 60)).unwrap();

            db.update_shards([2, 3].into_iter().collect()).await.unwrap();
            assert!(db.get_record(&kept).unwrap().is_some());
            assert_eq!(db.get_property(PROP_NUM_KEYS), 1);

            let added = db.record_key(3, 0, b"ns", b"added");
            db.put_record(&added, &mut sample_record(now_secs() + 60)).unwrap();
            assert!(db.get_record(&added).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_update_shards_by_prefix_compacts_removed() {
        let db = Database::in_memory(&config(ShardingKind::ByPrefix)).unwrap();
        let gone = db.record_key(1, 0, b"ns", b"gone");
        let kept = db.record_key(2, 0, b"ns", b"kept");
        db.put_record(&gone, &mut sample_record(now_secs() + 60)).unwrap();
        db.put_record(&kept, &mut sample_record(now_secs() + 60)).unwrap();

        db.update_shards([2, 3].into_iter().collect()).await.unwrap();
        assert!(db.get_record(&gone).unwrap().is_none());
        assert!(db.get_record(&kept).unwrap().is_some());
    }
}
