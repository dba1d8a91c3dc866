//! Storage key layout and shard placement.
//!
//! A record key is laid out as
//!
//! ```text
//! [shard id: u16 BE][micro-shard id: u8, only with micro-sharding][ns len: u8][namespace][key]
//! ```
//!
//! Prefix sharding stores the full key. Instance sharding strips the shard
//! prefix since each engine holds a single shard.

use crate::error::{Error, Result};
use crate::types::{MicroShardId, ShardId};
use bytes::{BufMut, Bytes, BytesMut};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Maximum namespace length representable in the key layout.
pub const MAX_NAMESPACE_LEN: usize = u8::MAX as usize;

/// Shape of the shard prefix in front of every stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyLayout {
    pub micro_shards: bool,
}

impl KeyLayout {
    pub fn new(micro_shards: bool) -> Self {
        Self { micro_shards }
    }

    /// Length of the shard (and micro-shard) prefix.
    pub fn prefix_len(&self) -> usize {
        if self.micro_shards {
            3
        } else {
            2
        }
    }

    /// Build the full storage key for a record.
    pub fn record_key(
        &self,
        shard_id: ShardId,
        micro_shard_id: MicroShardId,
        namespace: &[u8],
        key: &[u8],
    ) -> RecordKey {
        let mut buf = BytesMut::with_capacity(self.prefix_len() + 1 + namespace.len() + key.len());
        buf.put_u16(shard_id);
        if self.micro_shards {
            buf.put_u8(micro_shard_id);
        }
        buf.put_u8(namespace.len() as u8);
        buf.put_slice(namespace);
        buf.put_slice(key);
        RecordKey {
            bytes: buf.freeze(),
            prefix_len: self.prefix_len(),
        }
    }

    /// Split a full storage key into (namespace, key).
    pub fn decode(&self, full_key: &[u8]) -> Result<(Bytes, Bytes)> {
        if full_key.len() < self.prefix_len() {
            return Err(Error::InvalidRecord("storage key shorter than shard prefix".to_string()));
        }
        decode_without_prefix(&full_key[self.prefix_len()..])
    }
}

/// Split a storage key that carries no shard prefix into (namespace, key).
pub fn decode_without_prefix(data: &[u8]) -> Result<(Bytes, Bytes)> {
    let (ns_len, rest) = data
        .split_first()
        .ok_or_else(|| Error::InvalidRecord("empty storage key".to_string()))?;
    let ns_len = *ns_len as usize;
    if rest.len() < ns_len {
        return Err(Error::InvalidRecord(format!(
            "namespace length {} exceeds key length {}",
            ns_len,
            rest.len()
        )));
    }
    Ok((
        Bytes::copy_from_slice(&rest[..ns_len]),
        Bytes::copy_from_slice(&rest[ns_len..]),
    ))
}

/// Storage key of a record, with its shard prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    bytes: Bytes,
    prefix_len: usize,
}

impl RecordKey {
    /// Full key including the shard prefix.
    pub fn full(&self) -> &Bytes {
        &self.bytes
    }

    /// Key without the shard prefix.
    pub fn without_prefix(&self) -> &[u8] {
        &self.bytes[self.prefix_len..]
    }

    pub fn shard_id(&self) -> ShardId {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }
}

/// Hash a client key.
pub fn hash_key(key: &[u8]) -> u32 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish() as u32
}

/// Compute (shard, micro-shard) for a client key. The low bits pick the
/// shard, bits 16 and up pick the micro-shard.
pub fn shard_ids(key: &[u8], num_shards: u32, num_micro_shards: u32) -> (ShardId, MicroShardId) {
    let hash = hash_key(key);
    let shard_id = (hash % num_shards.max(1)) as ShardId;
    if num_micro_shards == 0 {
        return (shard_id, 0);
    }
    let micro = ((hash >> 16) % num_micro_shards.min(256)) as MicroShardId;
    (shard_id, micro)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_without_micro_shards() {
        let layout = KeyLayout::new(false);
        let rk = layout.record_key(0x0102, 9, b"ns", b"key");
        assert_eq!(rk.full().as_ref(), b"\x01\x02\x02nskey");
        assert_eq!(rk.without_prefix(), b"\x02nskey");
        assert_eq!(rk.shard_id(), 0x0102);

        let (ns, key) = layout.decode(rk.full()).unwrap();
        assert_eq!(ns.as_ref(), b"ns");
        assert_eq!(key.as_ref(), b"key");
    }

    #[test]
    fn test_layout_with_micro_shards() {
        let layout = KeyLayout::new(true);
        let rk = layout.record_key(3, 200, b"", b"k");
        assert_eq!(rk.full().as_ref(), &[0, 3, 200, 0, b'k']);
        assert_eq!(layout.prefix_len(), 3);

        let (ns, key) = layout.decode(rk.full()).unwrap();
        assert!(ns.is_empty());
        assert_eq!(key.as_ref(), b"k");
    }

    #[test]
    fn test_decode_rejects_truncated_keys() {
        assert!(decode_without_prefix(&[]).is_err());
        assert!(decode_without_prefix(&[5, b'a']).is_err());
        assert!(KeyLayout::new(true).decode(&[0, 1]).is_err());
    }

    #[test]
    fn test_shard_ids_are_stable_and_in_range() {
        for i in 0..200 {
            let key = format!("key-{}", i);
            let (shard, micro) = shard_ids(key.as_bytes(), 16, 8);
            assert!(shard < 16);
            assert!(micro < 8);
            assert_eq!((shard, micro), shard_ids(key.as_bytes(), 16, 8));
        }
        let (_, micro) = shard_ids(b"abc", 16, 0);
        assert_eq!(micro, 0);
    }
}
