//! Stored record codec.
//!
//! # Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! offset | field                             | size
//! -------+-----------------------------------+------
//!      0 | encoding version (0x01)           | 1
//!      1 | flags (bit 0: mark-deleted)       | 1
//!      2 | reserved                          | 2
//!      4 | expiration time (unix secs)       | 4
//!      8 | version                           | 4
//!     12 | creation time (unix secs)         | 4
//!     16 | last modification time (nanos)    | 8
//!     24 | request id of last modifier       | 16
//!     40 | originator request id             | 16
//!     56 | payload tag + payload data        | ...
//! ```

use crate::error::{Error, Result};
use crate::types::{
    now_nanos, now_secs, ttl_until, OpCode, OperationalMessage, Payload, PayloadKind, RequestId,
    ShardId,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed record header.
pub const HEADER_SIZE: usize = 56;

const ENCODING_VERSION: u8 = 0x01;
const FLAG_MARK_DELETE: u8 = 0x01;

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub version: u32,
    pub creation_time: u32,
    pub expiration_time: u32,
    pub last_modification_time: u64,
    pub request_id: RequestId,
    pub originator_request_id: RequestId,
    pub payload: Payload,
    pub(crate) flags: u8,
}

impl Record {
    /// Whether the record is a tombstone.
    pub fn is_marked_delete(&self) -> bool {
        self.flags & FLAG_MARK_DELETE != 0
    }

    pub fn mark_delete(&mut self) {
        self.flags |= FLAG_MARK_DELETE;
    }

    pub fn clear_mark_delete(&mut self) {
        self.flags &= !FLAG_MARK_DELETE;
    }

    /// Whether the record's lifetime has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }

    pub fn is_expired_at(&self, now: u32) -> bool {
        self.expiration_time < now
    }

    /// Zero every field.
    pub fn reset(&mut self) {
        *self = Record::default();
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.encoded_len()
    }

    /// Encode into a fresh buffer. Stamps the modification time if unset.
    pub fn encode(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&mut self, buf: &mut BytesMut) {
        if self.last_modification_time == 0 {
            tracing::warn!(request_id = %self.request_id, "Last modification time not set");
            self.last_modification_time = now_nanos();
        }
        buf.reserve(self.encoded_len());
        buf.put_u8(ENCODING_VERSION);
        buf.put_u8(self.flags);
        buf.put_u16(0);
        buf.put_u32(self.expiration_time);
        buf.put_u32(self.version);
        buf.put_u32(self.creation_time);
        buf.put_u64(self.last_modification_time);
        buf.put_slice(self.request_id.as_bytes());
        buf.put_slice(self.originator_request_id.as_bytes());
        if !self.payload.is_empty() {
            buf.put_u8(self.payload.kind as u8);
            buf.put_slice(&self.payload.data);
        }
    }

    /// Decode a stored value.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidRecord(format!(
                "value too short: {} bytes",
                data.len()
            )));
        }
        let mut cur = data;
        let encoding_version = cur.get_u8();
        if encoding_version != ENCODING_VERSION {
            return Err(Error::InvalidRecord(format!(
                "unsupported encoding version {}",
                encoding_version
            )));
        }
        let flags = cur.get_u8();
        cur.advance(2);
        let expiration_time = cur.get_u32();
        let version = cur.get_u32();
        let creation_time = cur.get_u32();
        let last_modification_time = cur.get_u64();
        let request_id = RequestId::from_slice(&cur[..RequestId::LEN]);
        cur.advance(RequestId::LEN);
        let originator_request_id = RequestId::from_slice(&cur[..RequestId::LEN]);
        cur.advance(RequestId::LEN);

        let payload = match cur.split_first() {
            Some((tag, rest)) => Payload {
                kind: PayloadKind::from_u8(*tag),
                data: Bytes::copy_from_slice(rest),
            },
            None => Payload::default(),
        };

        Ok(Self {
            version,
            creation_time,
            expiration_time,
            last_modification_time,
            request_id,
            originator_request_id,
            payload,
            flags,
        })
    }

    /// Build the message that mirrors this record onto a redistribution target.
    pub fn to_clone_message(&self, shard_id: ShardId, namespace: &[u8], key: &[u8]) -> OperationalMessage {
        OperationalMessage {
            opcode: Some(OpCode::Clone),
            namespace: Bytes::copy_from_slice(namespace),
            key: Bytes::copy_from_slice(key),
            payload: self.payload.clone(),
            time_to_live: ttl_until(self.expiration_time),
            shard_id,
            request_id: self.request_id,
            creation_time: self.creation_time,
            last_modification_time: self.last_modification_time,
            version: self.version,
            expiration_time: self.expiration_time,
            originator_request_id: self.originator_request_id,
            mark_delete: self.is_marked_delete(),
            ..Default::default()
        }
    }

    /// Build a record from the metadata carried by a Repair or Clone request.
    pub fn from_message(msg: &OperationalMessage) -> Self {
        let mut rec = Self {
            version: msg.version,
            creation_time: msg.creation_time,
            expiration_time: msg.expiration_time,
            last_modification_time: msg.last_modification_time,
            request_id: msg.request_id,
            originator_request_id: msg.originator_request_id,
            payload: msg.payload.clone(),
            flags: 0,
        };
        if msg.mark_delete {
            rec.mark_delete();
        }
        rec
    }
}
