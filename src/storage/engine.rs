//! Key-value engine abstraction.
//!
//! The sharding layer talks to ordered byte-key engines through [`KvEngine`].
//! [`MemoryEngine`] is the default; a RocksDB engine is available behind the
//! `rocksdb-storage` feature.

use crate::error::Result;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Property name for the number of live keys.
pub const PROP_NUM_KEYS: &str = "shardkv.num-keys";

/// An ordered key-value engine.
pub trait KvEngine: Send + Sync + std::fmt::Debug {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Point-in-time view for streaming.
    fn snapshot(&self) -> Result<Arc<dyn EngineSnapshot>>;

    /// Remove every key in `[start, end)` and reclaim the space. A missing
    /// end means the rest of the keyspace.
    fn compact_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()>;

    /// Engine-specific statistic.
    fn property(&self, name: &str) -> Option<String>;
}

/// Read-only view over an engine.
pub trait EngineSnapshot: Send + Sync {
    /// Iterate entries with key >= `start` in key order.
    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = Result<(Bytes, Bytes)>> + Send + 'a>;
}

/// Opens engines by name.
pub trait EngineFactory: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn KvEngine>>;
}

// ============================================================================
// In-memory engine
// ============================================================================

/// Ordered in-memory engine.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvEngine for MemoryEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data
            .write()
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<dyn EngineSnapshot>> {
        Ok(Arc::new(MemorySnapshot {
            data: self.data.read().clone(),
        }))
    }

    fn compact_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        let end = end.map_or(Bound::Unbounded, Bound::Excluded);
        let mut data = self.data.write();
        let doomed: Vec<Bytes> = data
            .range::<[u8], _>((Bound::Included(start), end))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            data.remove(&key);
        }
        Ok(())
    }

    fn property(&self, name: &str) -> Option<String> {
        match name {
            PROP_NUM_KEYS => Some(self.len().to_string()),
            _ => None,
        }
    }
}

struct MemorySnapshot {
    data: BTreeMap<Bytes, Bytes>,
}

impl EngineSnapshot for MemorySnapshot {
    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = Result<(Bytes, Bytes)>> + Send + 'a> {
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
                .map(|(k, v)| Ok((k.clone(), v.clone()))),
        )
    }
}

/// Hands out memory engines, returning the same engine for the same name.
#[derive(Debug, Default)]
pub struct MemoryEngineFactory {
    engines: Mutex<HashMap<String, Arc<MemoryEngine>>>,
}

impl MemoryEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn open(&self, name: &str) -> Result<Arc<dyn KvEngine>> {
        let engine = self
            .engines
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryEngine::new()))
            .clone();
        Ok(engine)
    }
}
