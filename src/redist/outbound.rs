//! Outbound queues toward a redistribution target node.
//!
//! Each target gets one [`OutboundProcessor`]: a high-priority queue for
//! realtime forwards and retries, a low-priority queue for snapshot traffic,
//! and a single worker that drains them in order, preferring the high queue.
//! Every queued item carries the [`Stats`] it reports into.

use crate::config::{OutboundConfig, RedistConfig};
use crate::error::{Error, Result};
use crate::redist::stats::Stats;
use crate::types::{OpStatus, OperationalMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A peer node that accepts replicated writes.
#[async_trait]
pub trait ReplicationTarget: Send + Sync {
    /// Send one message and wait for its reply.
    async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage>;

    /// Whether the target can take traffic right now.
    fn is_ready(&self) -> bool {
        true
    }

    /// Target address, for logging.
    fn addr(&self) -> &str;
}

/// Builds replication targets from node addresses.
pub trait TargetConnector: Send + Sync {
    fn connect(&self, addr: &str, config: &OutboundConfig) -> Arc<dyn ReplicationTarget>;
}

struct OutboundItem {
    msg: OperationalMessage,
    deadline: Instant,
    retries: u16,
    stats: Arc<Stats>,
}

/// Queues and worker for one target node.
pub struct OutboundProcessor {
    target: Arc<dyn ReplicationTarget>,
    high_tx: mpsc::Sender<OutboundItem>,
    low_tx: mpsc::Sender<OutboundItem>,
    queue_size: usize,
    queue_timeout: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundProcessor {
    /// Create the processor and spawn its worker.
    pub fn start(target: Arc<dyn ReplicationTarget>, config: &RedistConfig) -> Arc<Self> {
        let queue_size = config.outbound.queue_size.max(1);
        let (high_tx, high_rx) = mpsc::channel(queue_size);
        let (low_tx, low_rx) = mpsc::channel(queue_size);
        let cancel = CancellationToken::new();

        let worker = Worker {
            target: target.clone(),
            high_tx: high_tx.clone(),
            high_rx,
            low_rx,
            request_timeout: config.outbound.request_timeout,
            queue_timeout: config.resp_timeout,
            max_retry: config.max_retry,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        info!(peer = %target.addr(), queue_size, "Outbound processor started");

        Arc::new(Self {
            target,
            high_tx,
            low_tx,
            queue_size,
            queue_timeout: config.resp_timeout,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn addr(&self) -> &str {
        self.target.addr()
    }

    pub fn is_ready(&self) -> bool {
        !self.cancel.is_cancelled() && self.target.is_ready()
    }

    /// Number of items waiting in both queues.
    pub fn queued(&self) -> usize {
        (self.high_tx.max_capacity() - self.high_tx.capacity())
            + (self.low_tx.max_capacity() - self.low_tx.capacity())
    }

    /// Enqueue a realtime forward.
    pub fn send(&self, msg: OperationalMessage, stats: Arc<Stats>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotReady);
        }
        self.enqueue(&self.high_tx, msg, stats)
    }

    /// Enqueue snapshot traffic. Yields to realtime traffic by refusing when
    /// the target is down or the queues are half full.
    pub fn send_low_priority(&self, msg: OperationalMessage, stats: Arc<Stats>) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        if self.queued() >= self.queue_size / 2 {
            return Err(Error::QueueFull);
        }
        self.enqueue(&self.low_tx, msg, stats)
    }

    fn enqueue(
        &self,
        tx: &mpsc::Sender<OutboundItem>,
        msg: OperationalMessage,
        stats: Arc<Stats>,
    ) -> Result<()> {
        let item = OutboundItem {
            msg,
            deadline: Instant::now() + self.queue_timeout,
            retries: 0,
            stats,
        };
        tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::NotReady,
        })
    }

    /// Stop the worker. Items still queued are counted as drops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(peer = %self.target.addr(), "Outbound processor stopped");
    }
}

struct Worker {
    target: Arc<dyn ReplicationTarget>,
    high_tx: mpsc::Sender<OutboundItem>,
    high_rx: mpsc::Receiver<OutboundItem>,
    low_rx: mpsc::Receiver<OutboundItem>,
    request_timeout: Duration,
    queue_timeout: Duration,
    max_retry: u16,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(item) = self.high_rx.recv() => item,
                Some(item) = self.low_rx.recv() => item,
                else => break,
            };
            self.dispatch(item).await;
        }
        self.drain();
    }

    async fn dispatch(&self, mut item: OutboundItem) {
        if Instant::now() > item.deadline {
            debug!(peer = %self.target.addr(), "Queued request expired, dropping");
            item.stats.incr_drop();
            return;
        }

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => {
                item.stats.incr_drop();
                return;
            }
            r = tokio::time::timeout(self.request_timeout, self.target.send(&item.msg)) => r,
        };
        let status = match sent {
            Ok(Ok(resp)) => Some(resp.status),
            Ok(Err(e)) => {
                debug!(peer = %self.target.addr(), error = %e, "Replication send failed");
                None
            }
            Err(_) => {
                debug!(peer = %self.target.addr(), "Replication send timed out");
                None
            }
        };

        let retry = match status {
            None => true,
            Some(s) if s.is_replication_ok() => {
                item.stats.incr_ok();
                false
            }
            Some(s) if s.is_retryable_for_replication() => true,
            Some(s) => {
                info!(status = %s, "Replication rejected by target");
                item.stats.incr_fail();
                false
            }
        };
        if !retry {
            return;
        }

        if item.retries >= self.max_retry {
            info!(retries = item.retries, "Max replication retries reached, dropping");
            item.stats.incr_fail();
            return;
        }
        item.retries += 1;
        item.deadline = Instant::now() + self.queue_timeout;
        if let Err(e) = self.high_tx.try_send(item) {
            warn!("Replication queue full, dropping retry");
            let item = match e {
                mpsc::error::TrySendError::Full(i) | mpsc::error::TrySendError::Closed(i) => i,
            };
            item.stats.incr_drop();
        }
    }

    fn drain(&mut self) {
        self.high_rx.close();
        self.low_rx.close();
        let mut dropped = 0;
        while let Ok(item) = self.high_rx.try_recv() {
            item.stats.incr_drop();
            dropped += 1;
        }
        while let Ok(item) = self.low_rx.try_recv() {
            item.stats.incr_drop();
            dropped += 1;
        }
        if dropped > 0 {
            info!(peer = %self.target.addr(), dropped, "Dropped queued requests on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpCode, RequestId};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<OpStatus>>,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl ReplicationTarget for Scripted {
        async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let status = self.replies.lock().pop_front().unwrap_or(OpStatus::NoError);
            Ok(msg.reply_with_status(status))
        }

        fn addr(&self) -> &str {
            "scripted"
        }
    }

    fn msg() -> OperationalMessage {
        OperationalMessage::request(OpCode::Clone, "ns", "k", RequestId::new())
    }

    async fn wait_accounted(stats: &Stats) {
        for _ in 0..200 {
            if stats.all_accounted() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn scripted(replies: &[OpStatus]) -> Arc<Scripted> {
        Arc::new(Scripted {
            replies: Mutex::new(replies.iter().copied().collect()),
            sent: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let target = scripted(&[OpStatus::RecordLocked, OpStatus::RecordLocked, OpStatus::RecordLocked]);
        let proc = OutboundProcessor::start(target.clone(), &RedistConfig::default());
        let stats = Arc::new(Stats::new());

        proc.send(msg(), stats.clone()).unwrap();
        stats.incr_total();
        wait_accounted(&stats).await;

        assert_eq!(target.sent.load(Ordering::SeqCst), 4);
        assert_eq!(stats.ok(), 1);
        assert_eq!(stats.fail(), 0);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_counts_failure() {
        let target = scripted(&[OpStatus::NoStorageServer; 4]);
        let proc = OutboundProcessor::start(target.clone(), &RedistConfig::default());
        let stats = Arc::new(Stats::new());

        proc.send(msg(), stats.clone()).unwrap();
        stats.incr_total();
        wait_accounted(&stats).await;

        assert_eq!(target.sent.load(Ordering::SeqCst), 4);
        assert_eq!(stats.ok(), 0);
        assert_eq!(stats.fail(), 1);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_retryable_failure_and_conflict() {
        let target = scripted(&[OpStatus::BadParam, OpStatus::VersionConflict]);
        let proc = OutboundProcessor::start(target.clone(), &RedistConfig::default());
        let stats = Arc::new(Stats::new());

        for _ in 0..2 {
            proc.send(msg(), stats.clone()).unwrap();
            stats.incr_total();
        }
        wait_accounted(&stats).await;

        assert_eq!(stats.fail(), 1);
        assert_eq!(stats.ok(), 1);
        proc.shutdown().await;
    }

    struct Stalled;

    #[async_trait]
    impl ReplicationTarget for Stalled {
        async fn send(&self, _msg: &OperationalMessage) -> Result<OperationalMessage> {
            std::future::pending().await
        }

        fn addr(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_low_priority_refuses_when_half_full() {
        let config = RedistConfig::default().with_outbound(OutboundConfig::default().with_queue_size(4));
        let proc = OutboundProcessor::start(Arc::new(Stalled), &config);
        let stats = Arc::new(Stats::new());

        for _ in 0..3 {
            proc.send(msg(), stats.clone()).unwrap();
            stats.incr_total();
        }
        assert!(proc.queued() >= 2);
        assert!(matches!(
            proc.send_low_priority(msg(), stats.clone()),
            Err(Error::QueueFull)
        ));

        proc.shutdown().await;
        assert_eq!(stats.dropped(), 3);
        assert!(stats.all_accounted());
    }

    #[tokio::test]
    async fn test_send_refused_after_shutdown() {
        let proc = OutboundProcessor::start(scripted(&[]), &RedistConfig::default());
        proc.shutdown().await;

        let stats = Arc::new(Stats::new());
        assert!(matches!(
            proc.send_low_priority(msg(), stats.clone()),
            Err(Error::NotReady)
        ));
        assert!(matches!(proc.send(msg(), stats), Err(Error::NotReady)));
    }
}
