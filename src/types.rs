//! Core types used throughout the storage node.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Shard identifier.
pub type ShardId = u16;

/// Micro-shard identifier within a shard.
pub type MicroShardId = u8;

/// Node identifier within a zone.
pub type NodeId = u32;

/// Zone identifier.
pub type ZoneId = u32;

// ============================================================================
// Request identifiers
// ============================================================================

/// 128-bit request identifier. The all-zero value means "not set".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Length of the encoded identifier.
    pub const LEN: usize = 16;

    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// The unset identifier.
    pub const fn nil() -> Self {
        Self([0u8; 16])
    }

    /// Build from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, zero-padding or truncating to 16 bytes.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = [0u8; 16];
        let n = data.len().min(16);
        buf[..n].copy_from_slice(&data[..n]);
        Self(buf)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether the identifier carries a value.
    pub fn is_set(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

// ============================================================================
// Op codes and statuses
// ============================================================================

/// Operation code carried by every operational message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0x00,
    PrepareCreate = 0x81,
    Read = 0x82,
    PrepareUpdate = 0x83,
    PrepareSet = 0x84,
    PrepareDelete = 0x85,
    Delete = 0x86,
    Commit = 0xC1,
    Abort = 0xC2,
    Repair = 0xC3,
    MarkDelete = 0xC4,
    Clone = 0xE1,
}

impl OpCode {
    /// Whether the storage node serves this op code.
    pub fn is_for_storage(&self) -> bool {
        !matches!(self, OpCode::Nop)
    }

    /// Phase one of a two-phase write.
    pub fn is_prepare(&self) -> bool {
        matches!(
            self,
            OpCode::PrepareCreate
                | OpCode::PrepareUpdate
                | OpCode::PrepareSet
                | OpCode::PrepareDelete
        )
    }

    /// Phase two of a two-phase write.
    pub fn is_phase_two(&self) -> bool {
        matches!(self, OpCode::Commit | OpCode::Abort | OpCode::MarkDelete)
    }

    /// Wire value.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        Ok(match v {
            0x00 => OpCode::Nop,
            0x81 => OpCode::PrepareCreate,
            0x82 => OpCode::Read,
            0x83 => OpCode::PrepareUpdate,
            0x84 => OpCode::PrepareSet,
            0x85 => OpCode::PrepareDelete,
            0x86 => OpCode::Delete,
            0xC1 => OpCode::Commit,
            0xC2 => OpCode::Abort,
            0xC3 => OpCode::Repair,
            0xC4 => OpCode::MarkDelete,
            0xE1 => OpCode::Clone,
            other => return Err(other),
        })
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operation status returned in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpStatus {
    #[default]
    NoError = 0,
    BadMsg = 1,
    ServiceDenied = 2,
    NoKey = 3,
    DupKey = 4,
    BadParam = 7,
    RecordLocked = 8,
    NoUncommitted = 10,
    NoStorageServer = 12,
    Busy = 14,
    Inserting = 15,
    AlreadyFulfilled = 17,
    VersionConflict = 19,
    SSError = 21,
    SSOutofResource = 22,
    SSReadTTLExtendErr = 23,
    ReqProcTimeout = 24,
    CommitFailure = 25,
    Inconsistent = 26,
    KeyMarkedDelete = 27,
    NotSupported = 28,
}

impl OpStatus {
    /// Statuses a replicating sender should retry.
    pub fn is_retryable_for_replication(&self) -> bool {
        matches!(
            self,
            OpStatus::RecordLocked
                | OpStatus::NoStorageServer
                | OpStatus::ReqProcTimeout
                | OpStatus::SSOutofResource
        )
    }

    /// Statuses a replicating sender counts as delivered.
    pub fn is_replication_ok(&self) -> bool {
        matches!(self, OpStatus::NoError | OpStatus::VersionConflict)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Payload encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadKind {
    #[default]
    Clear = 0,
    EncryptedByClient = 1,
    EncryptedByProxy = 2,
    CompressedByClient = 3,
}

impl PayloadKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PayloadKind::EncryptedByClient,
            2 => PayloadKind::EncryptedByProxy,
            3 => PayloadKind::CompressedByClient,
            _ => PayloadKind::Clear,
        }
    }
}

/// Opaque value bytes with their encoding tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Bytes,
}

impl Payload {
    /// Clear-text payload.
    pub fn clear(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Clear,
            data: data.into(),
        }
    }

    /// Encoded length: tag byte plus data, or zero when empty.
    pub fn encoded_len(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            1 + self.data.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear_data(&mut self) {
        self.kind = PayloadKind::Clear;
        self.data = Bytes::new();
    }
}

// ============================================================================
// Operational message
// ============================================================================

/// Request or reply exchanged with proxies and peer storage nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationalMessage {
    pub opcode: Option<OpCode>,
    pub status: OpStatus,
    pub is_response: bool,
    pub namespace: Bytes,
    pub key: Bytes,
    pub payload: Payload,
    pub shard_id: ShardId,
    pub request_id: RequestId,
    pub originator_request_id: RequestId,
    pub version: u32,
    pub creation_time: u32,
    pub expiration_time: u32,
    pub last_modification_time: u64,
    pub time_to_live: u32,
    /// Set on writes sent by a peer node rather than a proxy.
    pub is_replication: bool,
    /// Used by Repair to write a tombstone.
    pub mark_delete: bool,
}

impl OperationalMessage {
    /// Create a request with the given op code, namespace and key.
    pub fn request(
        opcode: OpCode,
        namespace: impl Into<Bytes>,
        key: impl Into<Bytes>,
        request_id: RequestId,
    ) -> Self {
        Self {
            opcode: Some(opcode),
            namespace: namespace.into(),
            key: key.into(),
            request_id,
            ..Default::default()
        }
    }

    pub fn with_shard_id(mut self, shard_id: ShardId) -> Self {
        self.shard_id = shard_id;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Payload::clear(payload);
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.time_to_live = ttl;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_creation_time(mut self, creation_time: u32) -> Self {
        self.creation_time = creation_time;
        self
    }

    pub fn with_expiration_time(mut self, expiration_time: u32) -> Self {
        self.expiration_time = expiration_time;
        self
    }

    pub fn with_last_modification_time(mut self, lmt: u64) -> Self {
        self.last_modification_time = lmt;
        self
    }

    pub fn with_originator(mut self, originator: RequestId) -> Self {
        self.originator_request_id = originator;
        self
    }

    pub fn as_replication(mut self) -> Self {
        self.is_replication = true;
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode.unwrap_or(OpCode::Nop)
    }

    /// Reply skeleton carrying only the status and the request's identity.
    pub fn reply_with_status(&self, status: OpStatus) -> Self {
        Self {
            opcode: self.opcode,
            status,
            is_response: true,
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            request_id: self.request_id,
            shard_id: self.shard_id,
            ..Default::default()
        }
    }

    /// Reply carrying record metadata. The reply TTL depends on the op code:
    /// updates return the larger of requested and remaining TTL, reads the
    /// remaining TTL, everything else echoes the requested TTL.
    pub fn reply_with_meta(
        &self,
        status: OpStatus,
        version: u32,
        expiration_time: u32,
        creation_time: u32,
    ) -> Self {
        let mut resp = self.reply_with_status(status);
        resp.version = version;
        resp.creation_time = creation_time;

        let remaining = ttl_until(expiration_time);
        resp.time_to_live = match self.opcode() {
            OpCode::PrepareUpdate | OpCode::PrepareSet => self.time_to_live.max(remaining),
            OpCode::Read => remaining,
            OpCode::PrepareCreate
            | OpCode::Commit
            | OpCode::Abort
            | OpCode::PrepareDelete
            | OpCode::Delete
            | OpCode::Repair => self.time_to_live,
            _ => 0,
        };
        resp.expiration_time = expiration_from_now(resp.time_to_live);
        resp
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// ============================================================================
// Time helpers
// ============================================================================

/// Current unix time in seconds.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .min(u32::MAX as u64) as u32
}

/// Current unix time in nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u64::MAX as u128) as u64
}

/// Expiration time `ttl` seconds after `now`, saturating at `u32::MAX`.
pub fn expiration_from(now: u32, ttl: u32) -> u32 {
    now.saturating_add(ttl)
}

pub fn expiration_from_now(ttl: u32) -> u32 {
    expiration_from(now_secs(), ttl)
}

/// Seconds left until `expiration_time`, zero when already past.
pub fn ttl_until(expiration_time: u32) -> u32 {
    expiration_time.saturating_sub(now_secs())
}
