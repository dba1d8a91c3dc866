//! Shard-to-engine placement strategies.
//!
//! Two layouts are supported, selected once at startup:
//!
//! - [`InstanceSharding`]: one engine per owned shard, keys stored without
//!   the shard prefix.
//! - [`PrefixSharding`]: a fixed set of engines, shard `s` lives in
//!   `dbs[s % num_dbs]`, keys stored with their shard prefix so a shard is
//!   a contiguous key range.
//!
//! Both stream a shard's snapshot to a [`Replicator`] during redistribution.

mod instance;
mod prefix;

pub use instance::InstanceSharding;
pub use prefix::PrefixSharding;

use crate::error::Result;
use crate::redist::Replicator;
use crate::redist::SnapshotStatus;
use crate::storage::record_key::RecordKey;
use crate::types::ShardId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use tokio::time::Instant;
use tracing::info;

/// Storage layout for the shards owned by this node.
#[async_trait]
pub trait Sharding: Send + Sync + std::fmt::Debug {
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<()>;

    fn get(&self, key: &RecordKey) -> Result<Option<Bytes>>;

    fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Stream every live record of `shard_id` to the replicator, starting at
    /// micro-shard `start_micro_shard` when micro-sharding is on. Returns
    /// whether the shard was streamed completely.
    async fn replicate_snapshot(
        &self,
        shard_id: ShardId,
        rb: &Replicator,
        start_micro_shard: i32,
    ) -> bool;

    /// Build a strategy serving `shards`, sharing engines with this one.
    fn update_shards(&self, shards: &BTreeSet<ShardId>) -> Result<Box<dyn Sharding>>;

    /// Release storage held for shards this node no longer owns.
    fn compact_shards(&self, shards: &[ShardId]);

    fn shutdown(&self);

    /// Sum of a numeric engine property over all engines.
    fn get_property(&self, name: &str) -> u64;
}

// ============================================================================
// Micro-shard group progress
// ============================================================================

/// Progress of one micro-shard group while streaming a prefix shard.
#[derive(Debug)]
pub(crate) struct MicroShardGroup {
    pub start_id: u32,
    pub end_id: u32,
    pub keys: u64,
    pub expired: u64,
    pub errors: u64,
    pub last: bool,
    started: Instant,
}

impl MicroShardGroup {
    pub fn new(num_micro_shards: u32, per_group: u32, group: u32) -> Self {
        let mut g = Self {
            start_id: 0,
            end_id: 0,
            keys: 0,
            expired: 0,
            errors: 0,
            last: true,
            started: Instant::now(),
        };
        g.reset(num_micro_shards, per_group, group);
        g
    }

    /// Position on `group`. The final group absorbs any remainder.
    pub fn reset(&mut self, num_micro_shards: u32, per_group: u32, group: u32) {
        self.last = true;
        if num_micro_shards > 0 {
            self.start_id = group * per_group;
            self.end_id = (self.start_id + per_group).saturating_sub(1);
            let remaining = num_micro_shards as i64 - 1 - self.end_id as i64;
            if remaining < per_group as i64 {
                self.end_id = num_micro_shards - 1;
            } else {
                self.last = false;
            }
        }
        self.keys = 0;
        self.expired = 0;
        self.errors = 0;
        self.started = Instant::now();
    }

    /// Checkpoint the group. A group whose replies have not drained rolls
    /// back instead. Returns `true` when the run must abort.
    pub async fn log_stats(&self, shard_id: ShardId, rb: &Replicator, drained: bool) -> bool {
        info!(
            shard_id,
            start_id = self.start_id,
            end_id = self.end_id,
            keys = self.keys,
            expired = self.expired,
            errors = self.errors,
            drained,
            elapsed = ?self.started.elapsed(),
            "Micro-shard group streamed"
        );
        let stats = rb.snapshot_stats();
        stats.set_micro_shard_id(self.end_id as i32);
        stats.set_status(if self.last {
            SnapshotStatus::Finished
        } else {
            SnapshotStatus::InProgress
        });
        rb.log_stats(self.started, true, !drained).await
    }
}
