use crate::config::{NodeConfig, OutboundConfig, RedistConfig};
use crate::coord::{keys, ClusterReader, InMemoryCoordStore};
use crate::error::{NetworkError, Result};
use crate::processor::RequestProcessor;
use crate::redist::{OutboundProcessor, RedistContext, ReplicationTarget, Replicator, TargetConnector};
use crate::storage::{shard_ids, Database, Record};
use crate::types::{now_nanos, now_secs, OpCode, OpStatus, OperationalMessage, Payload, RequestId, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub(crate) const NUM_SHARDS: u32 = 16;
pub(crate) const ZONE: u32 = 1;

/// Poll `action` until `predicate` holds or `timeout` elapses.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(5);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

// ============================================================================
// Replication targets
// ============================================================================

/// Records every message and answers from a script, then with NoError.
pub struct MockTarget {
    replies: Mutex<VecDeque<OpStatus>>,
    sent: Mutex<Vec<OperationalMessage>>,
    ready: AtomicBool,
}

impl MockTarget {
    pub fn new() -> Arc<Self> {
        Self::with_script(&[])
    }

    pub fn with_script(replies: &[OpStatus]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().copied().collect()),
            sent: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<OperationalMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicationTarget for MockTarget {
    async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage> {
        self.sent.lock().push(msg.clone());
        let status = self.replies.lock().pop_front().unwrap_or(OpStatus::NoError);
        Ok(msg.reply_with_status(status))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn addr(&self) -> &str {
        "mock"
    }
}

/// Delivers messages straight into another node's processor.
pub struct ProcessorTarget {
    processor: Arc<RequestProcessor>,
}

impl ProcessorTarget {
    pub fn new(processor: Arc<RequestProcessor>) -> Arc<Self> {
        Arc::new(Self { processor })
    }
}

#[async_trait]
impl ReplicationTarget for ProcessorTarget {
    async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage> {
        self.processor
            .call(msg.clone())
            .await
            .map_err(|_| NetworkError::ConnectionClosed.into())
    }

    fn addr(&self) -> &str {
        "processor"
    }
}

/// Hands out the same target for every address.
pub struct MockConnector {
    target: Arc<dyn ReplicationTarget>,
}

impl MockConnector {
    pub fn new<T: ReplicationTarget + 'static>(target: Arc<T>) -> Self {
        Self { target }
    }
}

impl TargetConnector for MockConnector {
    fn connect(&self, _addr: &str, _config: &OutboundConfig) -> Arc<dyn ReplicationTarget> {
        self.target.clone()
    }
}

/// A replicator for `shard_id` wired to `target` through a fresh processor.
pub fn replicator_for<T: ReplicationTarget + 'static>(
    shard_id: ShardId,
    target: Arc<T>,
    store: Arc<InMemoryCoordStore>,
    config: RedistConfig,
) -> (Replicator, Arc<OutboundProcessor>) {
    let config = Arc::new(config);
    let processor = OutboundProcessor::start(target, &config);
    let rb = Replicator::new(
        shard_id,
        Some(processor.clone()),
        keys::redist_state_key(ZONE, 0, shard_id),
        0,
        store,
        config,
        CancellationToken::new(),
    );
    (rb, processor)
}

// ============================================================================
// Records and requests
// ============================================================================

pub fn sample_record(expiration_time: u32) -> Record {
    Record {
        version: 1,
        creation_time: now_secs(),
        expiration_time,
        last_modification_time: now_nanos(),
        request_id: RequestId::new(),
        originator_request_id: RequestId::nil(),
        payload: Payload::clear("value"),
        ..Default::default()
    }
}

/// A request in namespace "ns" addressed to the key's shard.
pub fn request(opcode: OpCode, key: &str) -> OperationalMessage {
    let (shard_id, _) = shard_ids(key.as_bytes(), NUM_SHARDS, 0);
    OperationalMessage::request(opcode, "ns", key.to_string(), RequestId::new()).with_shard_id(shard_id)
}

// ============================================================================
// Node fixtures
// ============================================================================

/// Node `node_id` of zone 1 owning all 16 shards, with short timers.
pub fn node_config(node_id: u32) -> NodeConfig {
    NodeConfig::new(ZONE, node_id)
        .with_num_shards(NUM_SHARDS)
        .with_shards(0..NUM_SHARDS as ShardId)
        .with_rec_lock_expiration(Duration::from_millis(300))
        .with_storage_swap_grace(Duration::from_millis(1))
        .with_shard_map_update_delay(Duration::from_millis(1))
        .with_redist_config(
            RedistConfig::default()
                .with_start_delay(Duration::from_secs(60))
                .with_resp_timeout(Duration::from_millis(500)),
        )
}

/// A disabled redistribution context that streams from `db` into `target`.
pub fn redist_context<T: ReplicationTarget + 'static>(
    config: &NodeConfig,
    reader: ClusterReader,
    db: Arc<Database>,
    target: Arc<T>,
) -> Arc<RedistContext> {
    Arc::new(RedistContext::new(
        config.redist.clone(),
        reader,
        db,
        Arc::new(MockConnector::new(target)),
    ))
}

/// A processor over fresh in-memory storage with redistribution disabled.
pub fn processor() -> (Arc<RequestProcessor>, Arc<Database>) {
    processor_with(node_config(0))
}

pub fn processor_with(config: NodeConfig) -> (Arc<RequestProcessor>, Arc<Database>) {
    let db = Arc::new(Database::in_memory(&config).unwrap());
    let reader = ClusterReader::new(Arc::new(InMemoryCoordStore::new()), config.zone_id, config.node_id);
    let redist = redist_context(&config, reader, db.clone(), MockTarget::new());
    (RequestProcessor::new(&config, db.clone(), redist), db)
}
