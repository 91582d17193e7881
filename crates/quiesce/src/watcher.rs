#![forbid(unsafe_code)]

//! The watcher registry.
//!
//! Watchers are (watch fn, listener, equality mode) triples stored per
//! scope. The last observed value starts as `None` — a sentinel no real
//! value compares equal to, including `Null` — so a freshly registered
//! watcher always fires its listener on the first digest pass.
//!
//! Storage discipline: slots are appended at the tail of the vector and the
//! digest scans them in index order, oldest first. That gives the two
//! properties mutation-during-scan needs:
//!
//! - a watcher registered from inside a listener lands past the scan
//!   cursor and is still visited in the same pass;
//! - deregistration overwrites the slot with a tombstone (`None`) and never
//!   shifts another slot's index, so handles stay valid mid-scan.
//!
//! Registration and deregistration both invalidate the digest's shortcut
//! marker, forcing at least one more full cycle over the tree.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::scope::{Scope, ScopeInner};
use crate::value::Value;
use crate::{BoxError, ExprFn, ListenerFn, WatchFn};

/// A registered watcher. Shared (`Rc`) so a scan can keep invoking it after
/// its slot was tombstoned under its feet.
pub(crate) struct Watcher {
    pub(crate) id: u64,
    pub(crate) watch: Rc<WatchFn>,
    pub(crate) listener: Rc<ListenerFn>,
    /// Deep mode compares structurally and snapshots by deep copy.
    pub(crate) deep: bool,
    /// Last observed value; `None` until the first evaluation.
    pub(crate) last: RefCell<Option<Value>>,
}

/// Box a watch closure for [`Scope::watch_group`].
pub fn watch_fn(f: impl Fn(&Scope) -> Result<Value, BoxError> + 'static) -> Rc<WatchFn> {
    Rc::new(f)
}

/// Deregistration handle for a single watcher.
///
/// Deregistration is explicit: dropping the handle leaves the watcher
/// active. `deregister` is idempotent and safe to call from inside a digest,
/// including from the watcher's own listener.
pub struct WatchHandle {
    scope: Weak<ScopeInner>,
    slot: usize,
}

impl WatchHandle {
    /// Tombstone the watcher's slot and invalidate the shortcut marker.
    pub fn deregister(&self) {
        let Some(inner) = self.scope.upgrade() else {
            return;
        };
        if let Some(slot) = inner.watchers.borrow_mut().get_mut(self.slot) {
            *slot = None;
        }
        inner.sched.clear_last_dirty();
    }
}

/// Deregistration handle for a watch group.
pub struct GroupHandle {
    handles: Vec<WatchHandle>,
    alive: Rc<Cell<bool>>,
}

impl GroupHandle {
    /// Deregister every member watcher. For an empty group this suppresses
    /// the pending one-shot listener call instead.
    pub fn deregister(&self) {
        self.alive.set(false);
        for handle in &self.handles {
            handle.deregister();
        }
    }
}

impl Scope {
    /// Register a watcher under identity equality (references and
    /// primitives, NaN equal to NaN).
    ///
    /// The listener receives `(new, old, scope)`; on the very first firing
    /// the old value is the new value itself.
    pub fn watch(
        &self,
        watch: impl Fn(&Scope) -> Result<Value, BoxError> + 'static,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), BoxError> + 'static,
    ) -> WatchHandle {
        self.watch_with(Rc::new(watch), Rc::new(listener), false)
    }

    /// Register a watcher under deep structural equality. The stored
    /// last-observed value is a deep copy, so later in-place mutation of the
    /// same container is still detected.
    pub fn watch_deep(
        &self,
        watch: impl Fn(&Scope) -> Result<Value, BoxError> + 'static,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), BoxError> + 'static,
    ) -> WatchHandle {
        self.watch_with(Rc::new(watch), Rc::new(listener), true)
    }

    pub(crate) fn watch_with(
        &self,
        watch: Rc<WatchFn>,
        listener: Rc<ListenerFn>,
        deep: bool,
    ) -> WatchHandle {
        let watcher = Rc::new(Watcher {
            id: self.inner.sched.next_watcher_id(),
            watch,
            listener,
            deep,
            last: RefCell::new(None),
        });
        let slot = {
            let mut watchers = self.inner.watchers.borrow_mut();
            watchers.push(Some(watcher));
            watchers.len() - 1
        };
        self.inner.sched.clear_last_dirty();
        WatchHandle {
            scope: Rc::downgrade(&self.inner),
            slot,
        }
    }

    /// Watch several expressions as one group.
    ///
    /// Each watch fn gets its own watcher; their values are collected into
    /// shared new/old sequences (one slot per fn). The first change detected
    /// anywhere in the group during a digest schedules exactly one listener
    /// call through the same-cycle task queue — further changes in the same
    /// pass do not schedule another. The first call passes the same sequence
    /// as both new and old values; later calls pass distinct sequences.
    ///
    /// An empty group schedules exactly one listener call (with empty
    /// sequences); deregistering before it runs suppresses it.
    pub fn watch_group(
        &self,
        watch_fns: Vec<Rc<WatchFn>>,
        listener: impl Fn(&[Value], &[Value], &Scope) -> Result<(), BoxError> + 'static,
    ) -> GroupHandle {
        let alive = Rc::new(Cell::new(true));
        let listener: Rc<dyn Fn(&[Value], &[Value], &Scope) -> Result<(), BoxError>> =
            Rc::new(listener);

        if watch_fns.is_empty() {
            let still_registered = Rc::clone(&alive);
            let listener = Rc::clone(&listener);
            self.eval_later(move |scope, _| {
                if still_registered.get() {
                    listener(&[], &[], scope)?;
                }
                Ok(Value::Null)
            });
            return GroupHandle {
                handles: Vec::new(),
                alive,
            };
        }

        let len = watch_fns.len();
        let state = Rc::new(RefCell::new(GroupState {
            new_values: vec![Value::Null; len],
            old_values: vec![Value::Null; len],
            reaction_scheduled: false,
            first_run: true,
        }));

        let reaction: Rc<ExprFn> = {
            let state = Rc::clone(&state);
            let listener = Rc::clone(&listener);
            Rc::new(move |scope, _| {
                let (new_values, old_values, first_run) = {
                    let mut state = state.borrow_mut();
                    state.reaction_scheduled = false;
                    let first_run = state.first_run;
                    state.first_run = false;
                    (state.new_values.clone(), state.old_values.clone(), first_run)
                };
                if first_run {
                    listener(&new_values, &new_values, scope)?;
                } else {
                    listener(&new_values, &old_values, scope)?;
                }
                Ok(Value::Null)
            })
        };

        let handles = watch_fns
            .into_iter()
            .enumerate()
            .map(|(idx, watch)| {
                let state = Rc::clone(&state);
                let reaction = Rc::clone(&reaction);
                let member: Rc<ListenerFn> = Rc::new(move |new, old, scope| {
                    let schedule = {
                        let mut state = state.borrow_mut();
                        state.new_values[idx] = new.clone();
                        state.old_values[idx] = old.clone();
                        !std::mem::replace(&mut state.reaction_scheduled, true)
                    };
                    if schedule {
                        scope.eval_later_rc(Rc::clone(&reaction));
                    }
                    Ok(())
                });
                self.watch_with(watch, member, false)
            })
            .collect();

        GroupHandle { handles, alive }
    }
}

/// Shared accumulation state of one watch group.
struct GroupState {
    new_values: Vec<Value>,
    old_values: Vec<Value>,
    reaction_scheduled: bool,
    first_run: bool,
}
