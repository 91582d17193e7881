#![forbid(unsafe_code)]

//! The digest engine: bounded fixed-point convergence over the tree.
//!
//! A digest repeatedly re-evaluates every live watcher in the tree and
//! invokes listeners for the ones whose value changed, until one full pass
//! finds nothing dirty and no same-cycle task pending. Listeners may mutate
//! state, register or deregister watchers, and queue more work; the loop
//! keeps going until quiescent or until [`MAX_DIGEST_PASSES`] is exhausted,
//! at which point it fails with a stabilization error.
//!
//! Two scan-level details carry the correctness argument:
//!
//! - watchers are scanned in registration order through live indices, so a
//!   watcher registered mid-pass is still reached, and tombstoned slots are
//!   simply skipped;
//! - the shortcut marker remembers the last dirty watcher anywhere in the
//!   tree. Re-reaching it clean means a full cycle passed without change,
//!   and the walk stops early — including across scope boundaries.
//!
//! Watch-function and listener errors are contained: reported to the tree's
//! error sink, never allowed to abort the pass.
//!
//! # Failure Modes
//!
//! - Coupled watchers that keep flipping each other's values: the digest
//!   errors out after exactly [`MAX_DIGEST_PASSES`] passes.
//! - `digest` or `apply` from inside a watch function or listener: phase
//!   conflict error, the outer cycle is unaffected.

use std::rc::Rc;

use crate::error::{ApplyError, BoxError, CallbackSite, DigestError};
use crate::scheduler::{Phase, QueuedExpr, Scheduler, TriggerKind};
use crate::scope::{self, Scope};
use crate::value::Value;
use crate::ExprFn;

/// Digest passes allowed before the tree is declared non-converging.
pub const MAX_DIGEST_PASSES: usize = 10;

impl Scope {
    /// Run a full digest cycle over the whole tree.
    ///
    /// Always anchored at the tree root, whichever scope it is invoked on.
    /// Drains the same-cycle task queue between passes, cancels and flushes
    /// a pending deferred-apply trigger first, and drains the post-digest
    /// queue once after the phase closes.
    ///
    /// # Errors
    ///
    /// - [`DigestError::Unstable`] when the tree is still dirty after
    ///   [`MAX_DIGEST_PASSES`] passes.
    /// - [`DigestError::PhaseConflict`] when a digest or apply is already
    ///   in progress.
    pub fn digest(&self) -> Result<(), DigestError> {
        let root = self.root();
        let sched = Rc::clone(&root.inner.sched);
        sched.clear_last_dirty();
        sched.begin_phase(Phase::Digest)?;

        // A pending deferred flush would re-apply this work later; run it
        // now instead so one cycle observes everything.
        if let Some(id) = sched.flush_trigger() {
            sched.cancel_trigger(id);
            root.flush_deferred_applies();
        }

        let mut passes = 0;
        loop {
            while let Some(task) = sched.pop_task() {
                if let Err(err) = task.scope.eval_queued(&task.expr) {
                    sched.report(CallbackSite::Task, err.as_ref());
                }
            }
            let dirty = digest_once(&root, &sched);
            passes += 1;
            tracing::trace!(target: "quiesce", passes, dirty, "digest pass");
            if dirty || sched.has_queued_tasks() {
                if passes >= MAX_DIGEST_PASSES {
                    sched.clear_phase();
                    tracing::debug!(target: "quiesce", passes, "digest did not stabilize");
                    return Err(DigestError::Unstable { passes });
                }
            } else {
                break;
            }
        }
        sched.clear_phase();

        while let Some(callback) = sched.pop_post_digest() {
            if let Err(err) = callback() {
                sched.report(CallbackSite::PostDigest, err.as_ref());
            }
        }
        Ok(())
    }

    /// Evaluate `expr` and digest the whole tree afterwards — on every exit
    /// path, including an expression failure.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::Digest`] for a phase conflict or a digest that fails;
    ///   a digest failure takes precedence over the expression's own error.
    /// - [`ApplyError::Expression`] when only the expression failed.
    pub fn apply(
        &self,
        expr: impl FnOnce(&Scope, Option<&Value>) -> Result<Value, BoxError>,
    ) -> Result<Value, ApplyError> {
        let sched = Rc::clone(&self.inner.sched);
        sched.begin_phase(Phase::Apply)?;
        let result = expr(self, None);
        sched.clear_phase();
        self.root().digest()?;
        result.map_err(ApplyError::Expression)
    }

    /// Queue `expr` for evaluation within the current digest cycle — or, if
    /// none is running, arrange for one on the next host turn.
    ///
    /// The arranged digest fires only if the queue is still non-empty when
    /// its trigger runs; a digest happening synchronously in between makes
    /// the trigger a no-op.
    pub fn eval_later(
        &self,
        expr: impl Fn(&Scope, Option<&Value>) -> Result<Value, BoxError> + 'static,
    ) {
        self.eval_later_rc(Rc::new(expr));
    }

    pub(crate) fn eval_later_rc(&self, expr: Rc<ExprFn>) {
        let sched = &self.inner.sched;
        if sched.phase().is_none() && !sched.has_queued_tasks() {
            sched.schedule_trigger(TriggerKind::Digest);
        }
        sched.queue_task(QueuedExpr {
            scope: self.clone(),
            expr,
        });
    }

    /// Queue `expr` for a later turn, coalesced: any number of deferred
    /// expressions queued before the flush trigger fires drain inside a
    /// single `apply` (one digest, not one per entry). Work queued this way
    /// never runs within the digest cycle that is currently in progress.
    pub fn apply_later(
        &self,
        expr: impl Fn(&Scope, Option<&Value>) -> Result<Value, BoxError> + 'static,
    ) {
        let sched = &self.inner.sched;
        sched.queue_deferred_apply(QueuedExpr {
            scope: self.clone(),
            expr: Rc::new(expr),
        });
        if sched.flush_trigger().is_none() {
            let id = sched.schedule_trigger(TriggerKind::Flush);
            sched.set_flush_trigger(Some(id));
        }
    }

    /// Drain the deferred-apply queue (FIFO, per-entry error containment)
    /// and clear the pending-flush marker.
    pub(crate) fn flush_deferred_applies(&self) {
        let sched = Rc::clone(&self.inner.sched);
        while let Some(task) = sched.pop_deferred_apply() {
            if let Err(err) = task.scope.eval_queued(&task.expr) {
                sched.report(CallbackSite::Task, err.as_ref());
            }
        }
        sched.set_flush_trigger(None);
    }

    /// Run `callback` once after the next digest cycle completes. The
    /// callback does not trigger digestion itself; errors are contained.
    pub fn after_digest(&self, callback: impl FnOnce() -> Result<(), BoxError> + 'static) {
        self.inner.sched.push_post_digest(Box::new(callback));
    }

    /// Run the next pending trigger (a scheduled digest or the coalesced
    /// deferred flush). Returns `false` when nothing was pending.
    ///
    /// Triggers model "a later turn of the control loop": the engine never
    /// suspends itself, the host pumps.
    pub fn tick(&self) -> bool {
        let root = self.root();
        let sched = Rc::clone(&root.inner.sched);
        let Some(trigger) = sched.pop_trigger() else {
            return false;
        };
        match trigger.kind {
            TriggerKind::Digest => {
                if sched.has_queued_tasks() {
                    if let Err(err) = root.digest() {
                        sched.report(CallbackSite::Trigger, &err);
                    }
                }
            }
            TriggerKind::Flush => {
                let result = root.apply(|scope, _| {
                    scope.flush_deferred_applies();
                    Ok(Value::Null)
                });
                if let Err(err) = result {
                    sched.report(CallbackSite::Trigger, &err);
                }
            }
        }
        true
    }

    /// Pump triggers until none are pending. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.tick() {
            ran += 1;
        }
        ran
    }

    /// Number of pending triggers awaiting [`tick`](Self::tick).
    #[must_use]
    pub fn pending_triggers(&self) -> usize {
        self.root().inner.sched.pending_triggers()
    }

    /// The phase currently holding the tree, if any.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.inner.sched.phase()
    }

    /// Replace the tree-wide error sink that receives contained callback
    /// errors. The default sink logs through `tracing`.
    pub fn set_error_sink(
        &self,
        sink: impl Fn(CallbackSite, &(dyn std::error::Error + 'static)) + 'static,
    ) {
        self.inner.sched.set_sink(Rc::new(sink));
    }
}

/// One pre-order pass over the whole tree. Returns whether anything was
/// found dirty.
fn digest_once(root: &Scope, sched: &Scheduler) -> bool {
    let mut dirty = false;
    scope::walk(&root.inner, &mut |node| {
        let scope = Scope {
            inner: Rc::clone(node),
        };
        let mut idx = 0;
        loop {
            let entry = {
                let watchers = node.watchers.borrow();
                match watchers.get(idx) {
                    Some(slot) => slot.clone(),
                    None => break,
                }
            };
            if let Some(watcher) = entry {
                match (watcher.watch)(&scope) {
                    Ok(new_value) => {
                        let last = watcher.last.borrow().clone();
                        let unchanged = match &last {
                            Some(old) => {
                                if watcher.deep {
                                    new_value == *old
                                } else {
                                    new_value.identical(old)
                                }
                            }
                            // Sentinel: nothing observed yet, always fire.
                            None => false,
                        };
                        if !unchanged {
                            sched.mark_last_dirty(watcher.id);
                            let old_value = last.unwrap_or_else(|| new_value.clone());
                            *watcher.last.borrow_mut() = Some(if watcher.deep {
                                new_value.deep_copy()
                            } else {
                                new_value.clone()
                            });
                            match (watcher.listener)(&new_value, &old_value, &scope) {
                                Ok(()) => dirty = true,
                                Err(err) => sched.report(CallbackSite::Listener, err.as_ref()),
                            }
                        } else if sched.last_dirty() == Some(watcher.id) {
                            // A full cycle since the last change: quiescent.
                            return false;
                        }
                    }
                    Err(err) => sched.report(CallbackSite::WatchFn, err.as_ref()),
                }
            }
            idx += 1;
        }
        true
    });
    dirty
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn first_digest_always_fires_the_listener() {
        let scope = Scope::new();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        scope.watch(
            |s| Ok(s.get("missing")),
            move |_, _, _| {
                seen.set(seen.get() + 1);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(calls.get(), 1, "even an undefined value fires once");

        scope.digest().unwrap();
        assert_eq!(calls.get(), 1, "quiescent afterwards");
    }

    #[test]
    fn first_firing_passes_the_new_value_as_the_old() {
        let scope = Scope::new();
        scope.set("greeting", "hi");
        let matched = Rc::new(Cell::new(false));
        let flag = Rc::clone(&matched);
        scope.watch(
            |s| Ok(s.get("greeting")),
            move |new, old, _| {
                flag.set(new == old);
                Ok(())
            },
        );
        scope.digest().unwrap();
        assert!(matched.get());
    }

    #[test]
    fn listener_fires_again_only_on_change() {
        let scope = Scope::new();
        scope.set("name", "a");
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        scope.watch(
            |s| Ok(s.get("name")),
            move |_, _, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
        );

        scope.digest().unwrap();
        scope.digest().unwrap();
        assert_eq!(calls.get(), 1);

        scope.set("name", "b");
        scope.digest().unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn shortcut_marker_ends_the_digest_on_the_last_dirty_watch() {
        let scope = Scope::new();
        let evals = Rc::new(Cell::new(0u32));
        for i in 0..10 {
            let name = format!("attr{i}");
            scope.set(name.clone(), i);
            let evals = Rc::clone(&evals);
            scope.watch(
                move |s| {
                    evals.set(evals.get() + 1);
                    Ok(s.get(&name))
                },
                |_, _, _| Ok(()),
            );
        }

        scope.digest().unwrap();
        assert_eq!(evals.get(), 20, "first digest runs two full passes");

        // Dirty only the first-registered watcher: the confirmation pass
        // stops as soon as it re-reaches it clean.
        scope.set("attr0", 99);
        evals.set(0);
        scope.digest().unwrap();
        assert_eq!(evals.get(), 11, "second pass ends after one evaluation");
    }

    #[test]
    fn unstable_watchers_fail_after_the_pass_bound() {
        let scope = Scope::new();
        scope.set("counter", 0);
        // Each pass bumps the watched value, so no pass is ever clean.
        scope.watch(
            |s| {
                let n = s.get_number("counter").unwrap_or(0.0);
                s.set("counter", n + 1.0);
                Ok(s.get("counter"))
            },
            |_, _, _| Ok(()),
        );

        let err = scope.digest().unwrap_err();
        match err {
            DigestError::Unstable { passes } => assert_eq!(passes, MAX_DIGEST_PASSES),
            other => panic!("expected Unstable, got {other:?}"),
        }
        assert_eq!(scope.phase(), None, "phase closes before the error escapes");

        // The tree stays usable afterwards.
        scope.set("counter", 0);
    }

    #[test]
    fn watch_errors_are_contained_and_reported() {
        let scope = Scope::new();
        scope.set("ok", 1);
        let reported = Rc::new(Cell::new(0));
        let sink_hits = Rc::clone(&reported);
        scope.set_error_sink(move |site, _| {
            assert_eq!(site, CallbackSite::WatchFn);
            sink_hits.set(sink_hits.get() + 1);
        });

        scope.watch(|_| Err("boom".into()), |_, _, _| Ok(()));
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        scope.watch(
            |s| Ok(s.get("ok")),
            move |_, _, _| {
                flag.set(true);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert!(fired.get(), "healthy watchers still run");
        assert!(reported.get() >= 1);
    }

    #[test]
    fn apply_digests_even_when_the_expression_fails() {
        let scope = Scope::new();
        scope.set("a", 1);
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        scope.watch(
            |s| Ok(s.get("a")),
            move |_, _, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
        );

        let err = scope.apply(|_, _| Err("expression failed".into())).unwrap_err();
        assert!(matches!(err, ApplyError::Expression(_)));
        assert_eq!(calls.get(), 1, "the digest must still have run");
    }

    #[test]
    fn digest_inside_apply_is_a_phase_conflict() {
        let scope = Scope::new();
        let observed = Rc::new(Cell::new(None));
        let slot = Rc::clone(&observed);
        scope
            .apply(move |s, _| {
                assert_eq!(s.phase(), Some(Phase::Apply));
                slot.set(Some(matches!(
                    s.digest(),
                    Err(DigestError::PhaseConflict { active: Phase::Apply })
                )));
                Ok(Value::Null)
            })
            .unwrap();
        assert_eq!(observed.get(), Some(true));
    }
}
