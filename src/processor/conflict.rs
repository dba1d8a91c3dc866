//! Conflict check for replicated writes.

use crate::storage::Record;
use crate::types::{expiration_from, now_secs, OpCode, OperationalMessage};

/// Version gap beyond which a newer replicated version is treated as stale.
/// Covers writes from nodes whose version counter wrapped or restarted.
pub const VERSION_WRAP_THRESHOLD: u32 = 32768;

/// Whether replicated `req` loses against the stored `rec`.
///
/// The modification time decides when the request carries one. Otherwise
/// the creation time, then the version, then the resulting expiration are
/// compared in turn.
pub fn is_conflict(req: &OperationalMessage, rec: &Record) -> bool {
    if req.last_modification_time != 0 {
        return req.last_modification_time < rec.last_modification_time;
    }

    if req.creation_time < rec.creation_time {
        return true;
    }
    if req.creation_time > rec.creation_time {
        return false;
    }

    if req.version < rec.version {
        return true;
    }
    if req.version == rec.version {
        let is_delete = matches!(req.opcode(), OpCode::Delete | OpCode::PrepareDelete);
        return !is_delete && expiration_from(now_secs(), req.time_to_live) < rec.expiration_time;
    }
    req.version - rec.version > VERSION_WRAP_THRESHOLD
}
