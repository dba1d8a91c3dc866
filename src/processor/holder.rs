//! Lock holders and their two-phase hand-off.
//!
//! A [`RequestHolder`] is what the lock table stores for a locked record. A
//! prepare arms its holder with a single-slot channel; the matching Commit,
//! Abort or MarkDelete is forwarded through that slot to the waiting prepare
//! task. Expiry and forwarding both take the slot under the same mutex, so a
//! phase-two request is either delivered or refused, never lost.

use crate::error::Error;
use crate::processor::RequestContext;
use crate::storage::Record;
use crate::types::{OpCode, RequestId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct TwoPhaseState {
    armed: bool,
    slot: Option<oneshot::Sender<RequestContext>>,
    db_rec_exist: bool,
    db_rec: Record,
}

/// Lock owner for one record.
#[derive(Debug)]
pub struct RequestHolder {
    request_id: RequestId,
    opcode: OpCode,
    state: Mutex<TwoPhaseState>,
}

impl RequestHolder {
    pub fn new(request_id: RequestId, opcode: OpCode) -> Self {
        Self {
            request_id,
            opcode,
            state: Mutex::new(TwoPhaseState::default()),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    fn reuse(&mut self, request_id: RequestId, opcode: OpCode) {
        self.request_id = request_id;
        self.opcode = opcode;
        *self.state.get_mut() = TwoPhaseState::default();
    }

    /// Start waiting for phase two.
    pub fn arm(&self) -> oneshot::Receiver<RequestContext> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.armed = true;
        state.slot = Some(tx);
        rx
    }

    /// Whether a prepare armed this holder.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Record the prepare's view of storage.
    pub fn set_record(&self, exist: bool, rec: Record) {
        let mut state = self.state.lock();
        state.db_rec_exist = exist;
        state.db_rec = rec;
    }

    /// Whether the prepare found a live record.
    pub fn record_exists(&self) -> bool {
        self.state.lock().db_rec_exist
    }

    /// The prepare's record, when armed over an existing record.
    pub fn fulfilled_record(&self) -> Option<Record> {
        let state = self.state.lock();
        (state.armed && state.db_rec_exist).then(|| state.db_rec.clone())
    }

    /// Close the slot. Later forwards fail with [`Error::LockExpired`].
    pub fn expire(&self) {
        self.state.lock().slot = None;
    }

    /// Hand a phase-two request to the waiting prepare. On failure the
    /// request is returned so the caller can reply.
    pub fn forward(
        &self,
        ctx: RequestContext,
    ) -> std::result::Result<(), (Error, RequestContext)> {
        let mut state = self.state.lock();
        if !state.armed {
            return Err((Error::MissingTwoPhaseContext, ctx));
        }
        match state.slot.take() {
            Some(tx) => tx.send(ctx).map_err(|ctx| (Error::LockExpired, ctx)),
            None => Err((Error::LockExpired, ctx)),
        }
    }
}

/// Recycles holders to avoid an allocation per request.
#[derive(Debug)]
pub struct HolderPool {
    free: Mutex<Vec<RequestHolder>>,
    capacity: usize,
}

impl HolderPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn acquire(&self, request_id: RequestId, opcode: OpCode) -> Arc<RequestHolder> {
        match self.free.lock().pop() {
            Some(mut holder) => {
                holder.reuse(request_id, opcode);
                Arc::new(holder)
            }
            None => Arc::new(RequestHolder::new(request_id, opcode)),
        }
    }

    /// Return a holder. Holders still referenced elsewhere are dropped instead.
    pub fn release(&self, holder: Arc<RequestHolder>) {
        if let Ok(holder) = Arc::try_unwrap(holder) {
            let mut free = self.free.lock();
            if free.len() < self.capacity {
                free.push(holder);
            }
        }
    }

    /// Holders waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
