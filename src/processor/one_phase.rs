//! One-phase operations.
//!
//! Each takes the record lock for the duration of its own write and replies
//! once. Read only locks when it has to extend the record's lifetime.

use super::{RequestContext, RequestHolder, RequestProcessor};
use crate::processor::conflict::is_conflict;
use crate::storage::Record;
use crate::types::{expiration_from_now, now_nanos, OpStatus, OperationalMessage};
use std::sync::Arc;
use tracing::{debug, error};

impl RequestProcessor {
    /// Lock the record for a one-phase operation. Replies RecordLocked and
    /// returns `None` when another request owns it.
    fn lock_one_phase(&self, ctx: &mut RequestContext) -> Option<Arc<RequestHolder>> {
        let holder = self.holders.acquire(ctx.msg.request_id, ctx.msg.opcode());
        let (owner, ok) = self.locks.acquire(&ctx.key, &holder);
        if ok && Arc::ptr_eq(&owner, &holder) {
            return Some(holder);
        }
        debug!(request_id = %ctx.msg.request_id, opcode = %ctx.msg.opcode(), "Record locked");
        drop(owner);
        self.holders.release(holder);
        ctx.reply_status(OpStatus::RecordLocked);
        None
    }

    pub(super) fn read(&self, mut ctx: RequestContext) {
        let mut rec = match self.db.get_record(&ctx.key) {
            Ok(Some(rec)) if !rec.is_expired() => rec,
            Ok(_) => {
                ctx.reply_status(OpStatus::NoKey);
                return;
            }
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Failed to read record");
                ctx.reply_status(OpStatus::SSError);
                return;
            }
        };

        let mut status = OpStatus::NoError;
        if rec.is_marked_delete() {
            status = OpStatus::KeyMarkedDelete;
        } else if ctx.msg.expiration_time > 0 && ctx.msg.expiration_time > rec.expiration_time {
            let holder = self.holders.acquire(ctx.msg.request_id, ctx.msg.opcode());
            let (owner, ok) = self.locks.acquire(&ctx.key, &holder);
            if ok && Arc::ptr_eq(&owner, &holder) {
                drop(owner);
                let mut extended = rec.clone();
                extended.expiration_time = ctx.msg.expiration_time;
                if let Err(e) = self.put_and_forward(&ctx, &mut extended) {
                    error!(request_id = %ctx.msg.request_id, error = %e, "Failed to extend ttl");
                    status = OpStatus::SSReadTTLExtendErr;
                }
                self.unlock(&ctx.key, holder);
                rec.expiration_time = extended.expiration_time;
            } else {
                drop(owner);
                self.holders.release(holder);
                status = OpStatus::SSReadTTLExtendErr;
            }
        }

        let mut resp = ctx.msg.reply_with_meta(
            status,
            rec.version,
            rec.expiration_time,
            rec.creation_time,
        );
        resp.payload = rec.payload;
        resp.originator_request_id = rec.originator_request_id;
        resp.last_modification_time = rec.last_modification_time;
        ctx.reply(resp);
    }

    pub(super) fn delete(&self, mut ctx: RequestContext) {
        let Some(holder) = self.lock_one_phase(&mut ctx) else {
            return;
        };

        let resp = match self.db.get_live_record(&ctx.key) {
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Failed to read record");
                ctx.msg.reply_with_status(OpStatus::SSError)
            }
            Ok(None) => ctx.msg.reply_with_status(OpStatus::NoKey),
            Ok(Some(rec)) if ctx.msg.is_replication && is_conflict(&ctx.msg, &rec) => ctx
                .msg
                .reply_with_meta(
                    OpStatus::VersionConflict,
                    rec.version,
                    rec.expiration_time,
                    rec.creation_time,
                ),
            Ok(Some(rec)) => match self.delete_and_forward(&ctx, &rec) {
                Ok(()) => ctx.msg.reply_with_meta(
                    OpStatus::NoError,
                    rec.version,
                    rec.expiration_time,
                    rec.creation_time,
                ),
                Err(e) => {
                    error!(request_id = %ctx.msg.request_id, error = %e, "Delete failed");
                    ctx.msg.reply_with_status(OpStatus::SSError)
                }
            },
        };
        self.unlock(&ctx.key, holder);
        ctx.reply(resp);
    }

    /// Overwrite the record with the metadata carried by the request.
    pub(super) fn repair(&self, mut ctx: RequestContext) {
        let Some(holder) = self.lock_one_phase(&mut ctx) else {
            return;
        };

        let mut rec = Record::from_message(&ctx.msg);
        let status = match self.put_and_forward(&ctx, &mut rec) {
            Ok(()) => OpStatus::NoError,
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Repair failed");
                OpStatus::SSError
            }
        };
        self.unlock(&ctx.key, holder);
        ctx.reply_status(status);
    }

    /// Like repair, but a stored record that wins the conflict check is kept.
    pub(super) fn clone_record(&self, mut ctx: RequestContext) {
        let Some(holder) = self.lock_one_phase(&mut ctx) else {
            return;
        };

        let resp = match self.db.get_live_record(&ctx.key) {
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Failed to read record");
                ctx.msg.reply_with_status(OpStatus::SSError)
            }
            Ok(Some(existing)) if is_conflict(&ctx.msg, &existing) => ctx.msg.reply_with_meta(
                OpStatus::VersionConflict,
                existing.version,
                existing.expiration_time,
                existing.creation_time,
            ),
            Ok(_) => {
                let mut rec = Record::from_message(&ctx.msg);
                match self.put_and_forward(&ctx, &mut rec) {
                    Ok(()) => ctx.msg.reply_with_status(OpStatus::NoError),
                    Err(e) => {
                        error!(request_id = %ctx.msg.request_id, error = %e, "Clone failed");
                        ctx.msg.reply_with_status(OpStatus::SSError)
                    }
                }
            }
        };
        self.unlock(&ctx.key, holder);
        ctx.reply(resp);
    }

    /// Tombstone the record without a preceding prepare.
    pub(super) fn mark_delete_one_phase(&self, mut ctx: RequestContext) {
        let Some(holder) = self.lock_one_phase(&mut ctx) else {
            return;
        };
        let req = &ctx.msg;

        let resp = match self.db.get_live_record(&ctx.key) {
            Err(e) => {
                error!(request_id = %req.request_id, error = %e, "Failed to read record");
                req.reply_with_status(OpStatus::SSError)
            }
            Ok(Some(rec)) if rec.request_id == req.request_id && rec.is_marked_delete() => req
                .reply_with_meta(
                    OpStatus::AlreadyFulfilled,
                    rec.version,
                    rec.expiration_time,
                    rec.creation_time,
                ),
            Ok(Some(mut rec)) => {
                rec.mark_delete();
                rec.last_modification_time = now_nanos();
                rec.version = match req.version {
                    0 => rec.version.wrapping_add(1),
                    v => v,
                };
                rec.request_id = req.request_id;
                rec.payload.clear_data();
                self.write_tombstone(&ctx, &mut rec)
            }
            Ok(None) if !req.originator_request_id.is_set() => {
                debug!(request_id = %req.request_id, "Mark delete of absent key without originator");
                req.reply_with_status(OpStatus::BadParam)
            }
            Ok(None) => {
                let mut rec = Record {
                    originator_request_id: req.originator_request_id,
                    creation_time: req.creation_time,
                    version: req.version.max(1),
                    request_id: req.request_id,
                    expiration_time: expiration_from_now(req.time_to_live),
                    last_modification_time: now_nanos(),
                    ..Default::default()
                };
                rec.mark_delete();
                self.write_tombstone(&ctx, &mut rec)
            }
        };
        self.unlock(&ctx.key, holder);
        ctx.reply(resp);
    }

    fn write_tombstone(&self, ctx: &RequestContext, rec: &mut Record) -> OperationalMessage {
        match self.put_and_forward(ctx, rec) {
            Ok(()) => ctx.msg.reply_with_status(OpStatus::NoError),
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Mark delete write failed");
                ctx.msg.reply_with_status(OpStatus::SSError)
            }
        }
    }
}
