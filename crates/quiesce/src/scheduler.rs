#![forbid(unsafe_code)]

//! The shared scheduling context.
//!
//! One [`Scheduler`] exists per scope tree. It is created with the root and
//! every branch holds the same `Rc`, never a duplicate: the phase token, the
//! task queues, the shortcut marker, and the error sink are tree-wide state.
//!
//! "Asynchronous" here means deferral to a later turn of the host's control
//! loop, not concurrency. Work that the original environment would hand to a
//! zero-delay timer is queued as a pending [`Trigger`] instead; the host
//! pumps triggers explicitly through [`Scope::tick`](crate::Scope::tick) or
//! [`Scope::run_until_idle`](crate::Scope::run_until_idle).
//!
//! # Invariants
//!
//! 1. At most one digest-or-apply is open tree-wide at any time.
//! 2. At most one deferred-flush trigger is pending per tree; enqueueing more
//!    deferred applies while one is pending only adds work.
//! 3. All queues are strict FIFO.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{CallbackSite, DigestError};
use crate::scope::Scope;
use crate::{ErrorSink, ExprFn, PostDigestFn};

/// Which engine operation currently holds the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A digest loop is running.
    Digest,
    /// An applied expression is being evaluated.
    Apply,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Digest => f.write_str("digest"),
            Self::Apply => f.write_str("apply"),
        }
    }
}

/// A queued expression bound to the scope it was scheduled on.
pub(crate) struct QueuedExpr {
    pub(crate) scope: Scope,
    pub(crate) expr: Rc<ExprFn>,
}

/// What a pending trigger does when the host pumps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerKind {
    /// Digest the tree, provided the task queue is still non-empty.
    Digest,
    /// Drain the deferred-apply queue inside a single apply.
    Flush,
}

/// A deferral to a later turn of the host's control loop.
pub(crate) struct Trigger {
    pub(crate) id: u64,
    pub(crate) kind: TriggerKind,
}

/// The sink installed on every fresh tree: report through `tracing`.
fn default_sink() -> Rc<ErrorSink> {
    Rc::new(|site, err| {
        tracing::error!(target: "quiesce", %site, error = %err, "contained callback error");
    })
}

/// Tree-wide scheduling state. See the module docs.
pub(crate) struct Scheduler {
    phase: Cell<Option<Phase>>,
    /// The last watcher found dirty anywhere in the tree; a clean re-visit
    /// of it means a full cycle passed without change.
    last_dirty: Cell<Option<u64>>,
    watcher_ids: Cell<u64>,
    trigger_ids: Cell<u64>,
    /// Same-cycle tasks, drained inside the digest loop.
    queued: RefCell<VecDeque<QueuedExpr>>,
    /// Deferred applies, drained by the coalesced flush.
    deferred_applies: RefCell<VecDeque<QueuedExpr>>,
    /// Id of the single pending flush trigger, if any.
    flush_trigger: Cell<Option<u64>>,
    post_digest: RefCell<VecDeque<Box<PostDigestFn>>>,
    triggers: RefCell<VecDeque<Trigger>>,
    sink: RefCell<Rc<ErrorSink>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            phase: Cell::new(None),
            last_dirty: Cell::new(None),
            watcher_ids: Cell::new(0),
            trigger_ids: Cell::new(0),
            queued: RefCell::new(VecDeque::new()),
            deferred_applies: RefCell::new(VecDeque::new()),
            flush_trigger: Cell::new(None),
            post_digest: RefCell::new(VecDeque::new()),
            triggers: RefCell::new(VecDeque::new()),
            sink: RefCell::new(default_sink()),
        }
    }

    // ---- phase token ----

    pub(crate) fn phase(&self) -> Option<Phase> {
        self.phase.get()
    }

    pub(crate) fn begin_phase(&self, phase: Phase) -> Result<(), DigestError> {
        match self.phase.get() {
            Some(active) => Err(DigestError::PhaseConflict { active }),
            None => {
                self.phase.set(Some(phase));
                Ok(())
            }
        }
    }

    pub(crate) fn clear_phase(&self) {
        self.phase.set(None);
    }

    // ---- shortcut marker ----

    pub(crate) fn last_dirty(&self) -> Option<u64> {
        self.last_dirty.get()
    }

    pub(crate) fn mark_last_dirty(&self, watcher: u64) {
        self.last_dirty.set(Some(watcher));
    }

    pub(crate) fn clear_last_dirty(&self) {
        self.last_dirty.set(None);
    }

    pub(crate) fn next_watcher_id(&self) -> u64 {
        let id = self.watcher_ids.get();
        self.watcher_ids.set(id + 1);
        id
    }

    // ---- same-cycle task queue ----

    pub(crate) fn queue_task(&self, task: QueuedExpr) {
        self.queued.borrow_mut().push_back(task);
    }

    pub(crate) fn pop_task(&self) -> Option<QueuedExpr> {
        self.queued.borrow_mut().pop_front()
    }

    pub(crate) fn has_queued_tasks(&self) -> bool {
        !self.queued.borrow().is_empty()
    }

    // ---- deferred applies ----

    pub(crate) fn queue_deferred_apply(&self, task: QueuedExpr) {
        self.deferred_applies.borrow_mut().push_back(task);
    }

    pub(crate) fn pop_deferred_apply(&self) -> Option<QueuedExpr> {
        self.deferred_applies.borrow_mut().pop_front()
    }

    pub(crate) fn flush_trigger(&self) -> Option<u64> {
        self.flush_trigger.get()
    }

    pub(crate) fn set_flush_trigger(&self, id: Option<u64>) {
        self.flush_trigger.set(id);
    }

    // ---- post-digest queue ----

    pub(crate) fn push_post_digest(&self, callback: Box<PostDigestFn>) {
        self.post_digest.borrow_mut().push_back(callback);
    }

    pub(crate) fn pop_post_digest(&self) -> Option<Box<PostDigestFn>> {
        self.post_digest.borrow_mut().pop_front()
    }

    // ---- pending triggers ----

    pub(crate) fn schedule_trigger(&self, kind: TriggerKind) -> u64 {
        let id = self.trigger_ids.get();
        self.trigger_ids.set(id + 1);
        self.triggers.borrow_mut().push_back(Trigger { id, kind });
        tracing::trace!(target: "quiesce", id, ?kind, "trigger scheduled");
        id
    }

    pub(crate) fn cancel_trigger(&self, id: u64) {
        self.triggers.borrow_mut().retain(|t| t.id != id);
    }

    pub(crate) fn pop_trigger(&self) -> Option<Trigger> {
        self.triggers.borrow_mut().pop_front()
    }

    pub(crate) fn pending_triggers(&self) -> usize {
        self.triggers.borrow().len()
    }

    // ---- error sink ----

    pub(crate) fn set_sink(&self, sink: Rc<ErrorSink>) {
        *self.sink.borrow_mut() = sink;
    }

    pub(crate) fn report(&self, site: CallbackSite, err: &(dyn std::error::Error + 'static)) {
        let sink = self.sink.borrow().clone();
        sink(site, err);
    }
}
