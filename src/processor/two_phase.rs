//! Two-phase writes.
//!
//! A prepare locks the record, replies with the record's current metadata
//! and, when the write may proceed, waits up to the lock expiration for the
//! phase-two request. Commit applies the write, Abort drops it, MarkDelete
//! turns the record into a tombstone. Without a phase-two request the lock is
//! released and storage is left untouched.

use super::{RequestContext, RequestProcessor};
use crate::error::Error;
use crate::processor::conflict::is_conflict;
use crate::storage::Record;
use crate::types::{now_nanos, now_secs, OpCode, OpStatus, OperationalMessage};
use std::sync::Arc;
use tracing::{debug, error};

/// The prepare's view of the record.
#[derive(Debug, Default)]
struct Prepared {
    exists: bool,
    rec: Record,
}

impl Prepared {
    /// Forget a tombstone so the write is handled as an insert.
    fn forget(&mut self) {
        self.exists = false;
        self.rec.reset();
    }
}

/// Whether a prepare answered with `status` keeps the lock for phase two.
fn waits_for_phase_two(opcode: OpCode, status: OpStatus) -> bool {
    matches!(
        status,
        OpStatus::NoError | OpStatus::AlreadyFulfilled | OpStatus::Inserting
    ) || (opcode == OpCode::PrepareDelete && status == OpStatus::NoKey)
}

fn meta_reply(req: &OperationalMessage, status: OpStatus, rec: &Record) -> OperationalMessage {
    req.reply_with_meta(status, rec.version, rec.expiration_time, rec.creation_time)
}

/// Metadata reply that also carries the record's audit fields.
fn audit_reply(req: &OperationalMessage, status: OpStatus, rec: &Record) -> OperationalMessage {
    let mut resp = meta_reply(req, status, rec);
    resp.originator_request_id = rec.originator_request_id;
    resp.last_modification_time = rec.last_modification_time;
    resp
}

fn prepare_create(req: &OperationalMessage, p: &mut Prepared) -> OperationalMessage {
    if p.exists {
        if p.rec.is_marked_delete() {
            p.forget();
            return req.reply_with_meta(OpStatus::Inserting, 0, 0, 0);
        }
        if p.rec.request_id == req.request_id {
            return meta_reply(req, OpStatus::AlreadyFulfilled, &p.rec);
        }
        let mut resp = meta_reply(req, OpStatus::DupKey, &p.rec);
        resp.originator_request_id = p.rec.originator_request_id;
        return resp;
    }
    req.reply_with_meta(OpStatus::NoError, 0, 0, 0)
}

fn prepare_set(req: &OperationalMessage, p: &Prepared) -> OperationalMessage {
    if !p.exists {
        return req.reply_with_meta(
            OpStatus::Inserting,
            0,
            req.expiration_time,
            req.creation_time,
        );
    }
    if p.rec.request_id == req.request_id {
        return meta_reply(req, OpStatus::AlreadyFulfilled, &p.rec);
    }
    let status = if p.rec.is_marked_delete() {
        OpStatus::Inserting
    } else {
        OpStatus::NoError
    };
    audit_reply(req, status, &p.rec)
}

/// PrepareUpdate with an expected version.
fn prepare_conditional_update(req: &OperationalMessage, p: &mut Prepared) -> OperationalMessage {
    let inserting = |req: &OperationalMessage| {
        req.reply_with_meta(
            OpStatus::Inserting,
            0,
            req.expiration_time,
            req.creation_time,
        )
    };

    if !p.exists {
        return inserting(req);
    }

    if req.is_replication {
        if p.rec.is_marked_delete() {
            p.forget();
            return audit_reply(req, OpStatus::Inserting, &p.rec);
        }
        if is_conflict(req, &p.rec) {
            return meta_reply(req, OpStatus::VersionConflict, &p.rec);
        }
        let mut resp = req.reply_with_meta(
            OpStatus::NoError,
            req.version,
            req.expiration_time,
            req.creation_time,
        );
        resp.originator_request_id = p.rec.originator_request_id;
        return resp;
    }

    if p.rec.is_marked_delete() {
        p.forget();
        return inserting(req);
    }

    let stale = req.version < p.rec.version
        || (req.creation_time != 0 && req.creation_time != p.rec.creation_time)
        || (req.originator_request_id.is_set()
            && req.originator_request_id != p.rec.originator_request_id);
    if stale {
        let mut resp = meta_reply(req, OpStatus::VersionConflict, &p.rec);
        resp.payload = p.rec.payload.clone();
        return resp;
    }

    let mut resp = meta_reply(req, OpStatus::NoError, &p.rec);
    resp.originator_request_id = p.rec.originator_request_id;
    resp
}

fn prepare_delete(req: &OperationalMessage, p: &Prepared) -> OperationalMessage {
    if !p.exists {
        return req.reply_with_status(OpStatus::NoKey);
    }
    if p.rec.request_id == req.request_id {
        return meta_reply(req, OpStatus::AlreadyFulfilled, &p.rec);
    }
    if req.is_replication && !p.rec.is_marked_delete() && is_conflict(req, &p.rec) {
        return meta_reply(req, OpStatus::VersionConflict, &p.rec);
    }
    let mut resp = audit_reply(req, OpStatus::NoError, &p.rec);
    resp.expiration_time = p.rec.expiration_time;
    resp
}

impl RequestProcessor {
    /// Prepare, then wait for and apply the phase-two request.
    pub(super) async fn process_two_phase(&self, mut ctx: RequestContext) {
        let opcode = ctx.msg.opcode();
        let holder = self.holders.acquire(ctx.msg.request_id, opcode);
        let (owner, ok) = self.locks.acquire(&ctx.key, &holder);
        if !ok {
            debug!(request_id = %ctx.msg.request_id, opcode = %opcode, "Record locked");
            ctx.reply_status(OpStatus::RecordLocked);
            self.holders.release(holder);
            return;
        }
        if !Arc::ptr_eq(&owner, &holder) {
            // Retried prepare while the original still holds the lock.
            let resp = match owner.fulfilled_record() {
                Some(rec) => meta_reply(&ctx.msg, OpStatus::AlreadyFulfilled, &rec),
                None => ctx.msg.reply_with_status(OpStatus::AlreadyFulfilled),
            };
            ctx.reply(resp);
            drop(owner);
            self.holders.release(holder);
            return;
        }
        drop(owner);

        let current = match self.db.get_live_record(&ctx.key) {
            Ok(rec) => rec,
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Failed to read record");
                self.unlock(&ctx.key, holder);
                ctx.reply_status(OpStatus::SSError);
                return;
            }
        };

        let mut rx = holder.arm();
        let mut prepared = Prepared {
            exists: current.is_some(),
            rec: current.unwrap_or_default(),
        };
        let resp = match opcode {
            OpCode::PrepareCreate => prepare_create(&ctx.msg, &mut prepared),
            OpCode::PrepareUpdate if ctx.msg.version > 0 => {
                prepare_conditional_update(&ctx.msg, &mut prepared)
            }
            OpCode::PrepareUpdate | OpCode::PrepareSet => prepare_set(&ctx.msg, &prepared),
            _ => prepare_delete(&ctx.msg, &prepared),
        };
        holder.set_record(prepared.exists, prepared.rec.clone());

        let status = resp.status;
        ctx.reply(resp);
        if !waits_for_phase_two(opcode, status) {
            self.unlock(&ctx.key, holder);
            return;
        }

        let waited = tokio::time::timeout(self.lock_expiration, &mut rx).await;
        let phase_two = match waited {
            Ok(received) => received.ok(),
            Err(_) => {
                holder.expire();
                rx.try_recv().ok()
            }
        };
        let Some(mut p2) = phase_two else {
            debug!(request_id = %ctx.msg.request_id, opcode = %opcode, "Prepare lock expired");
            self.unlock(&ctx.key, holder);
            return;
        };

        let resp = match p2.msg.opcode() {
            OpCode::Commit => self.commit(&ctx, &p2, prepared),
            OpCode::Abort => p2.msg.reply_with_status(OpStatus::NoError),
            OpCode::MarkDelete => self.mark_delete_prepared(&p2, prepared.rec),
            other => {
                debug!(opcode = %other, "Unexpected phase-two op code");
                p2.msg.reply_with_status(OpStatus::ServiceDenied)
            }
        };
        self.unlock(&ctx.key, holder);
        p2.reply(resp);
    }

    fn commit(&self, prepare: &RequestContext, commit: &RequestContext, prepared: Prepared) -> OperationalMessage {
        let req = &commit.msg;
        let is_delete = prepare.msg.opcode() == OpCode::PrepareDelete;
        if !is_delete {
            if req.creation_time == 0 {
                debug!(request_id = %req.request_id, "Commit without creation time");
                return req.reply_with_status(OpStatus::BadParam);
            }
            if !prepared.exists && req.expiration_time <= now_secs() {
                debug!(request_id = %req.request_id, "Commit of insert already expired");
                return req.reply_with_status(OpStatus::BadParam);
            }
        }

        let mut rec = prepared.rec;
        rec.request_id = req.request_id;
        rec.creation_time = req.creation_time;
        rec.version = req.version;
        rec.last_modification_time = req.last_modification_time;
        rec.payload = prepare.msg.payload.clone();
        if req.originator_request_id.is_set() {
            rec.originator_request_id = req.originator_request_id;
        } else if !prepared.exists {
            rec.originator_request_id = rec.request_id;
        }
        if req.expiration_time > rec.expiration_time && req.expiration_time > now_secs() {
            rec.expiration_time = req.expiration_time;
        }
        rec.clear_mark_delete();

        let written = if is_delete {
            self.delete_and_forward(commit, &rec)
        } else {
            self.put_and_forward(commit, &mut rec)
        };
        if let Err(e) = written {
            error!(request_id = %req.request_id, error = %e, "Commit write failed");
            return req.reply_with_status(OpStatus::SSError);
        }

        let mut resp = audit_reply(req, OpStatus::NoError, &rec);
        resp.expiration_time = rec.expiration_time;
        resp
    }

    /// Phase two of a PrepareDelete that keeps a tombstone.
    fn mark_delete_prepared(&self, p2: &RequestContext, mut rec: Record) -> OperationalMessage {
        let req = &p2.msg;
        rec.request_id = req.request_id;
        rec.version = rec.version.wrapping_add(1);
        rec.last_modification_time = now_nanos();
        rec.payload.clear_data();
        rec.mark_delete();

        if let Err(e) = self.put_and_forward(p2, &mut rec) {
            error!(request_id = %req.request_id, error = %e, "Mark delete write failed");
            return req.reply_with_status(OpStatus::SSError);
        }
        let mut resp = audit_reply(req, OpStatus::NoError, &rec);
        resp.expiration_time = rec.expiration_time;
        resp
    }

    pub(super) fn forward_commit(&self, ctx: RequestContext) {
        let mut ctx = match self.forward_to_prepare(ctx) {
            Ok(()) => return,
            Err((e, ctx)) => {
                debug!(request_id = %ctx.msg.request_id, error = %e, "Commit not forwarded");
                ctx
            }
        };

        match self.db.get_live_record(&ctx.key) {
            Err(e) => {
                error!(request_id = %ctx.msg.request_id, error = %e, "Failed to read record");
                ctx.reply_status(OpStatus::SSError);
            }
            Ok(Some(rec)) if rec.request_id == ctx.msg.request_id => {
                let resp = meta_reply(&ctx.msg, OpStatus::AlreadyFulfilled, &rec);
                ctx.reply(resp);
            }
            Ok(_) => ctx.reply_status(OpStatus::NoUncommitted),
        }
    }

    pub(super) fn forward_abort(&self, ctx: RequestContext) {
        if let Err((e, mut ctx)) = self.forward_to_prepare(ctx) {
            debug!(request_id = %ctx.msg.request_id, error = %e, "Abort not forwarded");
            ctx.reply_status(OpStatus::NoUncommitted);
        }
    }

    /// MarkDelete: phase two of a pending PrepareDelete, or a stand-alone
    /// tombstone write.
    pub(super) fn mark_delete(&self, ctx: RequestContext) {
        let ctx = match self.forward_to_prepare(ctx) {
            Ok(()) => return,
            Err((Error::MissingTwoPhaseContext, mut ctx))
                if self.locks.lookup(&ctx.key, &ctx.msg.request_id).is_some() =>
            {
                // Locked by a one-phase operation with the same request id.
                ctx.reply_status(OpStatus::RecordLocked);
                return;
            }
            Err((_, ctx)) => ctx,
        };
        self.mark_delete_one_phase(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_secs, Payload, RequestId};

    fn stored(version: u32) -> Record {
        Record {
            version,
            creation_time: 100,
            expiration_time: now_secs() + 1000,
            last_modification_time: 5,
            request_id: RequestId::new(),
            originator_request_id: RequestId::new(),
            payload: Payload::clear("v"),
            ..Default::default()
        }
    }

    fn req(opcode: OpCode) -> OperationalMessage {
        OperationalMessage::request(opcode, "ns", "k", RequestId::new()).with_ttl(60)
    }

    #[test]
    fn test_prepare_create_outcomes() {
        let r = req(OpCode::PrepareCreate);
        let mut absent = Prepared::default();
        assert_eq!(prepare_create(&r, &mut absent).status, OpStatus::NoError);

        let mut dup = Prepared { exists: true, rec: stored(3) };
        let resp = prepare_create(&r, &mut dup);
        assert_eq!(resp.status, OpStatus::DupKey);
        assert_eq!(resp.version, 3);
        assert_eq!(resp.originator_request_id, dup.rec.originator_request_id);

        let mut mine = Prepared { exists: true, rec: stored(3) };
        mine.rec.request_id = r.request_id;
        assert_eq!(prepare_create(&r, &mut mine).status, OpStatus::AlreadyFulfilled);

        let mut tomb = Prepared { exists: true, rec: stored(3) };
        tomb.rec.mark_delete();
        assert_eq!(prepare_create(&r, &mut tomb).status, OpStatus::Inserting);
        assert!(!tomb.exists);
        assert_eq!(tomb.rec, Record::default());
    }

    #[test]
    fn test_prepare_set_outcomes() {
        let r = req(OpCode::PrepareSet).with_expiration_time(now_secs() + 60);
        let resp = prepare_set(&r, &Prepared::default());
        assert_eq!(resp.status, OpStatus::Inserting);
        assert_eq!(resp.version, 0);

        let p = Prepared { exists: true, rec: stored(10) };
        let resp = prepare_set(&r, &p);
        assert_eq!(resp.status, OpStatus::NoError);
        assert_eq!(resp.version, 10);
        assert_eq!(resp.last_modification_time, 5);

        let mut tomb = Prepared { exists: true, rec: stored(10) };
        tomb.rec.mark_delete();
        assert_eq!(prepare_set(&r, &tomb).status, OpStatus::Inserting);
    }

    #[test]
    fn test_conditional_update_checks_version() {
        let p = || Prepared { exists: true, rec: stored(10) };

        let older = req(OpCode::PrepareUpdate).with_version(9);
        let resp = prepare_conditional_update(&older, &mut p());
        assert_eq!(resp.status, OpStatus::VersionConflict);
        assert_eq!(resp.payload, Payload::clear("v"));

        let wrong_ct = req(OpCode::PrepareUpdate).with_version(10).with_creation_time(99);
        assert_eq!(
            prepare_conditional_update(&wrong_ct, &mut p()).status,
            OpStatus::VersionConflict
        );

        let ok = req(OpCode::PrepareUpdate).with_version(10).with_creation_time(100);
        let resp = prepare_conditional_update(&ok, &mut p());
        assert_eq!(resp.status, OpStatus::NoError);
        assert_eq!(resp.version, 10);
    }

    #[test]
    fn test_replicated_conditional_update() {
        let mut p = Prepared { exists: true, rec: stored(10) };
        let stale = req(OpCode::PrepareUpdate)
            .with_version(9)
            .with_creation_time(100)
            .as_replication();
        assert_eq!(
            prepare_conditional_update(&stale, &mut p).status,
            OpStatus::VersionConflict
        );

        let newer = req(OpCode::PrepareUpdate)
            .with_version(11)
            .with_creation_time(100)
            .as_replication();
        let resp = prepare_conditional_update(&newer, &mut p);
        assert_eq!(resp.status, OpStatus::NoError);
        assert_eq!(resp.version, 11);
    }

    #[test]
    fn test_prepare_delete_outcomes() {
        let r = req(OpCode::PrepareDelete);
        assert_eq!(prepare_delete(&r, &Prepared::default()).status, OpStatus::NoKey);

        let p = Prepared { exists: true, rec: stored(4) };
        let resp = prepare_delete(&r, &p);
        assert_eq!(resp.status, OpStatus::NoError);
        assert_eq!(resp.expiration_time, p.rec.expiration_time);

        let stale = req(OpCode::PrepareDelete)
            .with_last_modification_time(1)
            .as_replication();
        assert_eq!(prepare_delete(&stale, &p).status, OpStatus::VersionConflict);
    }

    #[test]
    fn test_waits_for_phase_two() {
        assert!(waits_for_phase_two(OpCode::PrepareSet, OpStatus::Inserting));
        assert!(waits_for_phase_two(OpCode::PrepareDelete, OpStatus::NoKey));
        assert!(!waits_for_phase_two(OpCode::PrepareCreate, OpStatus::DupKey));
        assert!(!waits_for_phase_two(OpCode::PrepareUpdate, OpStatus::VersionConflict));
    }
}
