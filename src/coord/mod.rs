//! Coordination store access.
//!
//! The cluster publishes shard ownership, node addresses and redistribution
//! commands in a strongly consistent key-value store. This module defines the
//! [`CoordinationStore`] interface, an in-memory implementation, the key
//! vocabulary ([`keys`]) and typed readers over it ([`reader`]).

pub mod keys;
pub mod reader;

use crate::error::{CoordError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

pub use keys::RedistTag;
pub use reader::ClusterReader;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// A change observed on a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// One operation of an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Stream of watch events for keys under a prefix.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next matching event, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.key().starts_with(&self.prefix) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, skipped = n, "Watch stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Strongly consistent key-value store shared by the cluster.
#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug {
    /// Read a key. `None` when absent.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Read every key starting with `prefix`, in key order.
    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Single put attempt.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete_value(&self, key: &str) -> Result<()>;

    /// Apply all operations atomically.
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Subscribe to changes of keys starting with `prefix`.
    fn watch(&self, prefix: &str) -> WatchStream;

    /// Put with retries, sleeping `backoff` between attempts.
    async fn put_value(
        &self,
        key: &str,
        value: &str,
        max_tries: u32,
        backoff: Duration,
    ) -> Result<()> {
        let max_tries = max_tries.max(1);
        for attempt in 1..=max_tries {
            match self.put(key, value).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_tries => {
                    warn!(key, attempt, error = %e, "Coordination put failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(key, error = %e, "Coordination put failed");
                }
            }
        }
        Err(CoordError::PutFailed {
            key: key.to_string(),
            tries: max_tries,
        }
        .into())
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory store with watch notifications.
#[derive(Debug)]
pub struct InMemoryCoordStore {
    data: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`CoordError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordError::Unavailable.into())
        }
    }

    fn notify(&self, ev: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(ev);
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        debug!(key, value, "Coordination put");
        self.data.write().insert(key.to_string(), value.to_string());
        self.notify(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        self.check_available()?;
        if self.data.write().remove(key).is_some() {
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.check_available()?;
        let mut events = Vec::with_capacity(ops.len());
        {
            let mut data = self.data.write();
            for op in ops {
                match op {
                    TxnOp::Put { key, value } => {
                        data.insert(key.clone(), value.clone());
                        events.push(WatchEvent::Put { key, value });
                    }
                    TxnOp::Delete { key } => {
                        if data.remove(&key).is_some() {
                            events.push(WatchEvent::Delete { key });
                        }
                    }
                }
            }
        }
        for ev in events {
            self.notify(ev);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        WatchStream::new(prefix, self.events.subscribe())
    }
}
