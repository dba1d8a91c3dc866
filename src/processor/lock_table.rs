//! Per-record lock table.
//!
//! A record is locked by inserting its holder under the record key. The map is
//! split per shard so a busy shard does not contend with the others.

use crate::processor::holder::RequestHolder;
use crate::storage::RecordKey;
use crate::types::RequestId;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Record key to the holder currently locking it.
pub struct LockTable {
    shards: Vec<DashMap<Bytes, Arc<RequestHolder>>>,
}

impl LockTable {
    pub fn new(num_shards: u32) -> Self {
        let shards = (0..num_shards.max(1)).map(|_| DashMap::new()).collect();
        Self { shards }
    }

    fn map(&self, key: &RecordKey) -> &DashMap<Bytes, Arc<RequestHolder>> {
        &self.shards[key.shard_id() as usize % self.shards.len()]
    }

    /// Lock `key` for `candidate`.
    ///
    /// Returns the current owner and whether the caller may proceed: `true`
    /// when `candidate` was inserted, or when the existing owner carries the
    /// same request id (a retried request).
    pub fn acquire(
        &self,
        key: &RecordKey,
        candidate: &Arc<RequestHolder>,
    ) -> (Arc<RequestHolder>, bool) {
        match self.map(key).entry(key.full().clone()) {
            Entry::Occupied(e) => {
                let owner = e.get().clone();
                let same = owner.request_id() == candidate.request_id();
                (owner, same)
            }
            Entry::Vacant(e) => {
                e.insert(candidate.clone());
                (candidate.clone(), true)
            }
        }
    }

    /// Unlock `key` if `owner` still holds it.
    pub fn release(&self, key: &RecordKey, owner: &Arc<RequestHolder>) {
        self.map(key)
            .remove_if(key.full(), |_, held| Arc::ptr_eq(held, owner));
    }

    /// The holder locking `key`, if it belongs to `request_id`.
    pub fn lookup(&self, key: &RecordKey, request_id: &RequestId) -> Option<Arc<RequestHolder>> {
        self.map(key)
            .get(key.full())
            .filter(|h| h.request_id() == *request_id)
            .map(|h| h.clone())
    }

    /// Number of locked records.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("shards", &self.shards.len())
            .field("locked", &self.len())
            .finish()
    }
}
