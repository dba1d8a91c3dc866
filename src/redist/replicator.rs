//! Per-shard forwarding to the shard's new owner.

use crate::config::RedistConfig;
use crate::coord::CoordinationStore;
use crate::error::{Error, Result};
use crate::redist::outbound::OutboundProcessor;
use crate::redist::stats::{SnapshotStatus, Stats};
use crate::types::{OperationalMessage, ShardId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATS_PUT_TRIES: u32 = 5;
const STATS_PUT_BACKOFF: Duration = Duration::from_secs(5);

/// Forwards one outgoing shard's snapshot and realtime writes.
pub struct Replicator {
    shard_id: ShardId,
    processor: Option<Arc<OutboundProcessor>>,
    snapshot_stats: Arc<Stats>,
    realtime_stats: Arc<Stats>,
    stats_key: String,
    rate_limit_kbps: AtomicU64,
    store: Arc<dyn CoordinationStore>,
    config: Arc<RedistConfig>,
    stop: CancellationToken,
}

impl Replicator {
    pub fn new(
        shard_id: ShardId,
        processor: Option<Arc<OutboundProcessor>>,
        stats_key: String,
        rate_limit_kbps: u64,
        store: Arc<dyn CoordinationStore>,
        config: Arc<RedistConfig>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            shard_id,
            processor,
            snapshot_stats: Arc::new(Stats::new()),
            realtime_stats: Arc::new(Stats::new()),
            stats_key,
            rate_limit_kbps: AtomicU64::new(rate_limit_kbps),
            store,
            config,
            stop,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn stats_key(&self) -> &str {
        &self.stats_key
    }

    pub fn config(&self) -> &RedistConfig {
        &self.config
    }

    pub fn snapshot_stats(&self) -> &Arc<Stats> {
        &self.snapshot_stats
    }

    pub fn realtime_stats(&self) -> &Arc<Stats> {
        &self.realtime_stats
    }

    /// Whether the owning manager asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn rate_limit_kbps(&self) -> u64 {
        self.rate_limit_kbps.load(Ordering::Relaxed)
    }

    pub fn set_rate_limit_kbps(&self, kbps: u64) {
        self.rate_limit_kbps.store(kbps, Ordering::Relaxed);
    }

    /// Snapshot throttle: the per-run override when set, else the configured default.
    pub fn effective_rate_limit_kbps(&self) -> u64 {
        match self.rate_limit_kbps() {
            0 => self.config.snapshot_rate_limit_kbps,
            kbps => kbps,
        }
    }

    /// Queue a message for the target, flagged as replicated. Realtime
    /// messages use the high-priority queue and realtime stats, snapshot
    /// messages the low-priority queue and snapshot stats. A refused message
    /// counts as sent and dropped only when `count_on_failure` is set.
    pub fn send_request(
        &self,
        msg: OperationalMessage,
        realtime: bool,
        count_on_failure: bool,
    ) -> Result<()> {
        let Some(processor) = &self.processor else {
            return Err(Error::NotReady);
        };
        let msg = msg.as_replication();

        let stats = if realtime {
            &self.realtime_stats
        } else {
            &self.snapshot_stats
        };

        let result = if realtime {
            processor.send(msg, stats.clone())
        } else {
            processor.send_low_priority(msg, stats.clone())
        };

        match result {
            Ok(()) => {
                stats.incr_total();
                Ok(())
            }
            Err(e) => {
                if count_on_failure {
                    stats.incr_total();
                    stats.incr_drop();
                }
                debug!(shard_id = self.shard_id, realtime, error = %e, "Forwarding refused");
                Err(e)
            }
        }
    }

    /// Every snapshot message sent so far has been accounted for.
    pub fn is_snapshot_done(&self) -> bool {
        self.snapshot_stats.all_accounted()
    }

    /// Resume counting from a persisted checkpoint.
    pub fn restore_snapshot_state(&self, persisted: &Stats) {
        self.snapshot_stats.restore(persisted);
    }

    /// Decide whether the run must abort, checkpoint or roll back the
    /// snapshot stats, and optionally persist them. Returns `true` on abort.
    pub async fn log_stats(&self, start: Instant, persist: bool, force_abort: bool) -> bool {
        let cfg = &self.config;
        let abort = self
            .snapshot_stats
            .should_abort(cfg.drop_threshold, cfg.err_threshold)
            || self
                .realtime_stats
                .should_abort(cfg.drop_threshold_realtime, cfg.err_threshold_realtime)
            || force_abort;

        if abort {
            self.snapshot_stats.set_status(SnapshotStatus::Aborted);
            self.snapshot_stats.restore_from_checkpoint();
        } else {
            self.snapshot_stats.save_checkpoint();
        }

        let elapsed = start.elapsed();
        let snapshot = self.snapshot_stats.to_stats_string(elapsed);
        if persist {
            if let Err(e) = self
                .store
                .put_value(&self.stats_key, &snapshot, STATS_PUT_TRIES, STATS_PUT_BACKOFF)
                .await
            {
                warn!(shard_id = self.shard_id, error = %e, "Failed to persist redistribution stats");
            }
        }

        info!(
            shard_id = self.shard_id,
            snapshot = %snapshot,
            realtime = %self.realtime_stats.to_stats_string(elapsed),
            "Redistribution stats"
        );
        abort
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("shard_id", &self.shard_id)
            .field("stats_key", &self.stats_key)
            .field("target", &self.processor.as_ref().map(|p| p.addr().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::InMemoryCoordStore;
    use crate::redist::outbound::ReplicationTarget;
    use crate::types::{OpCode, OpStatus, RequestId};
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl ReplicationTarget for AlwaysOk {
        async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage> {
            Ok(msg.reply_with_status(OpStatus::NoError))
        }

        fn addr(&self) -> &str {
            "ok"
        }
    }

    fn replicator(processor: Option<Arc<OutboundProcessor>>, store: Arc<InMemoryCoordStore>) -> Replicator {
        Replicator::new(
            3,
            processor,
            "redist_state_01_000_00003".to_string(),
            0,
            store,
            Arc::new(RedistConfig::default()),
            CancellationToken::new(),
        )
    }

    fn msg() -> OperationalMessage {
        OperationalMessage::request(OpCode::Clone, "ns", "k", RequestId::new())
    }

    #[tokio::test]
    async fn test_send_without_processor() {
        let rb = replicator(None, Arc::new(InMemoryCoordStore::new()));
        assert!(matches!(rb.send_request(msg(), true, true), Err(Error::NotReady)));
        assert_eq!(rb.realtime_stats().total(), 0);
    }

    #[tokio::test]
    async fn test_refused_send_counts_drop_when_asked() {
        let proc = OutboundProcessor::start(Arc::new(AlwaysOk), &RedistConfig::default());
        proc.shutdown().await;
        let rb = replicator(Some(proc), Arc::new(InMemoryCoordStore::new()));

        assert!(rb.send_request(msg(), false, false).is_err());
        assert_eq!(rb.snapshot_stats().total(), 0);

        assert!(rb.send_request(msg(), true, true).is_err());
        assert_eq!(rb.realtime_stats().total(), 1);
        assert_eq!(rb.realtime_stats().dropped(), 1);
    }

    #[tokio::test]
    async fn test_log_stats_persists_and_checkpoints() {
        let store = Arc::new(InMemoryCoordStore::new());
        let proc = OutboundProcessor::start(Arc::new(AlwaysOk), &RedistConfig::default());
        let rb = replicator(Some(proc.clone()), store.clone());

        rb.send_request(msg(), false, true).unwrap();
        for _ in 0..100 {
            if rb.is_snapshot_done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(rb.is_snapshot_done());

        rb.snapshot_stats().set_status(SnapshotStatus::Finished);
        let abort = rb.log_stats(Instant::now(), true, false).await;
        assert!(!abort);

        let persisted = store.get_value(rb.stats_key()).await.unwrap().unwrap();
        assert!(persisted.starts_with("st=F&total=1&ok=1&err=0&drop=0"));
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_abort_rolls_back_to_checkpoint() {
        let store = Arc::new(InMemoryCoordStore::new());
        let rb = replicator(None, store.clone());
        rb.snapshot_stats().incr_total();
        rb.snapshot_stats().incr_ok();
        rb.snapshot_stats().save_checkpoint();
        rb.snapshot_stats().incr_total();

        let abort = rb.log_stats(Instant::now(), true, true).await;
        assert!(abort);
        assert_eq!(rb.snapshot_stats().status(), SnapshotStatus::Aborted);
        assert_eq!(rb.snapshot_stats().total(), 1);

        let persisted = store.get_value(rb.stats_key()).await.unwrap().unwrap();
        assert!(persisted.starts_with("st=A&total=1&ok=1"));
    }

    #[tokio::test]
    async fn test_threshold_abort() {
        let rb = replicator(None, Arc::new(InMemoryCoordStore::new()));
        for _ in 0..10 {
            rb.snapshot_stats().incr_total();
        }
        rb.snapshot_stats().incr_drop();
        assert!(rb.log_stats(Instant::now(), false, false).await);
    }

    #[test]
    fn test_effective_rate_limit() {
        let rb = replicator(None, Arc::new(InMemoryCoordStore::new()));
        assert_eq!(rb.effective_rate_limit_kbps(), 10_000);
        rb.set_rate_limit_kbps(50);
        assert_eq!(rb.effective_rate_limit_kbps(), 50);
    }
}
