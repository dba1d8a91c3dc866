//! Request processing.
//!
//! [`RequestProcessor`] validates each inbound [`OperationalMessage`] and
//! drives it through the per-record state machine:
//!
//! - two-phase writes: a prepare locks the record and waits for the matching
//!   Commit, Abort or MarkDelete ([`two_phase`])
//! - one-phase operations: Read, Delete, Repair, Clone and stand-alone
//!   MarkDelete ([`one_phase`])
//!
//! Every successful mutation is mirrored to the shard's new owner while the
//! node is a redistribution source.

mod conflict;
mod holder;
mod lock_table;
mod one_phase;
mod two_phase;

pub use conflict::{is_conflict, VERSION_WRAP_THRESHOLD};
pub use holder::{HolderPool, RequestHolder};
pub use lock_table::LockTable;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::redist::RedistContext;
use crate::storage::{shard_ids, Database, Record, RecordKey};
use crate::types::{ttl_until, OpCode, OpStatus, OperationalMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const MAX_NAMESPACE_LEN: usize = 255;

// ============================================================================
// Request context
// ============================================================================

/// A request in flight together with where its reply goes.
#[derive(Debug)]
pub struct RequestContext {
    pub msg: OperationalMessage,
    pub key: RecordKey,
    reply_tx: Option<oneshot::Sender<OperationalMessage>>,
}

impl RequestContext {
    pub fn new(msg: OperationalMessage, key: RecordKey) -> (Self, oneshot::Receiver<OperationalMessage>) {
        let (tx, rx) = oneshot::channel();
        (Self::with_reply(msg, key, tx), rx)
    }

    fn with_reply(
        msg: OperationalMessage,
        key: RecordKey,
        reply_tx: oneshot::Sender<OperationalMessage>,
    ) -> Self {
        Self {
            msg,
            key,
            reply_tx: Some(reply_tx),
        }
    }

    /// Send the reply. Only the first reply is delivered.
    pub fn reply(&mut self, resp: OperationalMessage) {
        match self.reply_tx.take() {
            Some(tx) => {
                if tx.send(resp).is_err() {
                    debug!(request_id = %self.msg.request_id, "Reply receiver gone");
                }
            }
            None => warn!(
                request_id = %self.msg.request_id,
                opcode = %self.msg.opcode(),
                "Request already replied"
            ),
        }
    }

    pub fn reply_status(&mut self, status: OpStatus) {
        let resp = self.msg.reply_with_status(status);
        self.reply(resp);
    }

    pub fn is_replied(&self) -> bool {
        self.reply_tx.is_none()
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Serves storage requests for the shards this node owns.
pub struct RequestProcessor {
    db: Arc<Database>,
    redist: Arc<RedistContext>,
    locks: LockTable,
    holders: HolderPool,
    validate_shard_id: bool,
    lock_expiration: Duration,
}

impl RequestProcessor {
    pub fn new(config: &NodeConfig, db: Arc<Database>, redist: Arc<RedistContext>) -> Arc<Self> {
        Arc::new(Self {
            locks: LockTable::new(db.num_shards()),
            holders: HolderPool::new(config.holder_pool_size),
            db,
            redist,
            validate_shard_id: config.validate_shard_id,
            lock_expiration: config.rec_lock_expiration,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    /// Process `msg` on its own task. The reply is sent on `reply_tx`.
    pub fn submit(self: &Arc<Self>, msg: OperationalMessage, reply_tx: oneshot::Sender<OperationalMessage>) {
        let this = self.clone();
        tokio::spawn(async move { this.process(msg, reply_tx).await });
    }

    /// Process `msg` and wait for its reply. A prepare replies before its
    /// lock is released; the rest of its work continues in the background.
    pub async fn call(self: &Arc<Self>, msg: OperationalMessage) -> Result<OperationalMessage> {
        let (tx, rx) = oneshot::channel();
        self.submit(msg, tx);
        rx.await.map_err(|_| Error::Cancelled)
    }

    async fn process(&self, msg: OperationalMessage, reply_tx: oneshot::Sender<OperationalMessage>) {
        let opcode = msg.opcode();
        if opcode == OpCode::Nop {
            let mut echo = msg;
            echo.is_response = true;
            let _ = reply_tx.send(echo);
            return;
        }

        let (shard_id, micro_shard_id) =
            shard_ids(&msg.key, self.db.num_shards(), self.db.num_micro_shards());
        if self.validate_shard_id && opcode != OpCode::Clone && shard_id != msg.shard_id {
            debug!(
                declared = msg.shard_id,
                computed = shard_id,
                "Shard id does not match key"
            );
            let _ = reply_tx.send(msg.reply_with_status(OpStatus::BadParam));
            return;
        }

        let key = self
            .db
            .record_key(msg.shard_id, micro_shard_id, &msg.namespace, &msg.key);
        let mut ctx = RequestContext::with_reply(msg, key, reply_tx);

        if !opcode.is_for_storage() {
            ctx.reply_status(OpStatus::ServiceDenied);
            return;
        }
        if let Err(reason) = self.validate(&ctx.msg) {
            debug!(request_id = %ctx.msg.request_id, opcode = %opcode, reason, "Invalid request");
            ctx.reply_status(OpStatus::BadParam);
            return;
        }

        match opcode {
            OpCode::PrepareCreate
            | OpCode::PrepareUpdate
            | OpCode::PrepareSet
            | OpCode::PrepareDelete => self.process_two_phase(ctx).await,
            OpCode::Commit => self.forward_commit(ctx),
            OpCode::Abort => self.forward_abort(ctx),
            OpCode::MarkDelete => self.mark_delete(ctx),
            OpCode::Read => self.read(ctx),
            OpCode::Delete => self.delete(ctx),
            OpCode::Repair => self.repair(ctx),
            OpCode::Clone => self.clone_record(ctx),
            OpCode::Nop => {}
        }
    }

    fn validate(&self, msg: &OperationalMessage) -> std::result::Result<(), &'static str> {
        if !msg.request_id.is_set() {
            return Err("missing request id");
        }
        if msg.namespace.is_empty() {
            return Err("missing namespace");
        }
        if msg.namespace.len() > MAX_NAMESPACE_LEN {
            return Err("namespace too long");
        }
        if msg.key.is_empty() {
            return Err("missing key");
        }
        match msg.opcode() {
            OpCode::PrepareCreate => {
                if msg.time_to_live == 0 {
                    return Err("missing ttl");
                }
                if msg.is_replication
                    && (msg.creation_time == 0 || msg.version == 0)
                {
                    return Err("replicated create without metadata");
                }
            }
            OpCode::PrepareSet | OpCode::PrepareUpdate => {
                if msg.is_replication && (msg.creation_time == 0 || msg.version == 0) {
                    return Err("replicated update without metadata");
                }
            }
            _ => {}
        }
        if !self.db.shard_supported(msg.shard_id) {
            return Err("shard not served");
        }
        Ok(())
    }

    // ========================================================================
    // Storage writes with redistribution forwarding
    // ========================================================================

    fn unlock(&self, key: &RecordKey, holder: Arc<RequestHolder>) {
        self.locks.release(key, &holder);
        self.holders.release(holder);
    }

    /// Write `rec` and mirror it to the shard's new owner.
    fn put_and_forward(&self, ctx: &RequestContext, rec: &mut Record) -> Result<()> {
        self.db.put_record(&ctx.key, rec)?;
        if self.redist.is_enabled() {
            let msg = rec.to_clone_message(ctx.msg.shard_id, &ctx.msg.namespace, &ctx.msg.key);
            self.redist.forward(ctx.msg.shard_id, msg);
        }
        Ok(())
    }

    /// Remove the record and mirror the removal as a tombstone write.
    fn delete_and_forward(&self, ctx: &RequestContext, rec: &Record) -> Result<()> {
        self.db.delete_record(&ctx.key)?;
        if self.redist.is_enabled() {
            let msg = OperationalMessage::request(
                OpCode::MarkDelete,
                ctx.msg.namespace.clone(),
                ctx.msg.key.clone(),
                ctx.msg.request_id,
            )
            .with_shard_id(ctx.msg.shard_id)
            .with_ttl(ttl_until(rec.expiration_time))
            .with_creation_time(rec.creation_time)
            .with_last_modification_time(rec.last_modification_time)
            .with_originator(rec.originator_request_id)
            .with_version(rec.version.wrapping_add(1));
            self.redist.forward(ctx.msg.shard_id, msg);
        }
        Ok(())
    }

    /// Hand a phase-two request to the prepare holding the record lock.
    fn forward_to_prepare(
        &self,
        ctx: RequestContext,
    ) -> std::result::Result<(), (Error, RequestContext)> {
        match self.locks.lookup(&ctx.key, &ctx.msg.request_id) {
            Some(holder) => holder.forward(ctx),
            None => Err((Error::MissingTwoPhaseContext, ctx)),
        }
    }
}

impl std::fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("locks", &self.locks)
            .field("validate_shard_id", &self.validate_shard_id)
            .field("lock_expiration", &self.lock_expiration)
            .finish()
    }
}
