#![forbid(unsafe_code)]

//! Shallow collection diffing on top of the watcher registry.
//!
//! A collection watch detects changes *inside* a container — elements added,
//! removed, replaced or reordered; keys added, changed or removed — without
//! the cost of deep equality. The wrapped watcher does not observe the raw
//! value: it observes a running change counter, bumped every time the diff
//! against an internally maintained snapshot finds a difference. The
//! snapshot mirrors the watched container and is updated in place as
//! differences are recorded.
//!
//! Diff rules per value shape:
//!
//! - `List` is the only array-like shape: a change is a previous snapshot of
//!   a different shape, a length difference, or any element differing under
//!   NaN-aware identity.
//! - `Map` is the keyed case: per-key additions and (identity) changes, plus
//!   removals detected cheaply by comparing key cardinality before sweeping.
//!   A map with a `"length"` key is still a map.
//! - Everything else compares as a plain identity watch (NaN equal to NaN).
//!
//! The listener's old-value argument is the new value itself on the first
//! firing. Afterwards it is the most recent distinct prior value — captured
//! as a shallow copy after each firing, and only when the listener was
//! registered through [`Scope::watch_collection_with_old`]; the plain
//! [`Scope::watch_collection`] form never pays for the copy.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::scope::Scope;
use crate::value::Value;
use crate::watcher::WatchHandle;
use crate::{BoxError, ListenerFn, WatchFn};

/// Internally maintained mirror of the last seen value.
enum Snapshot {
    /// Nothing observed yet.
    None,
    Scalar(Value),
    List(Vec<Value>),
    Map(AHashMap<String, Value>),
}

/// Closure shapes accepted by the two registration forms.
enum CollectionListener {
    Current(Rc<dyn Fn(&Value, &Scope) -> Result<(), BoxError>>),
    WithOld(Rc<dyn Fn(&Value, &Value, &Scope) -> Result<(), BoxError>>),
}

struct CollectionState {
    snapshot: Snapshot,
    change_count: u64,
    /// Latest watched value, handed to the listener.
    current: Value,
    /// Most recent distinct prior value (tracked only with `WithOld`).
    previous: Value,
    first_run: bool,
}

/// Diff `new_value` against the snapshot, updating the snapshot in place.
/// Returns the new change count.
fn diff(snapshot: &mut Snapshot, new_value: &Value, mut count: u64) -> u64 {
    match new_value {
        Value::List(items) => {
            let items = items.borrow();
            if !matches!(snapshot, Snapshot::List(_)) {
                count += 1;
                *snapshot = Snapshot::List(Vec::new());
            }
            if let Snapshot::List(prev) = snapshot {
                if prev.len() != items.len() {
                    count += 1;
                    prev.resize(items.len(), Value::Null);
                }
                for (idx, item) in items.iter().enumerate() {
                    if !item.identical(&prev[idx]) {
                        count += 1;
                        prev[idx] = item.clone();
                    }
                }
            }
        }
        Value::Map(entries) => {
            let entries = entries.borrow();
            if !matches!(snapshot, Snapshot::Map(_)) {
                count += 1;
                *snapshot = Snapshot::Map(AHashMap::new());
            }
            if let Snapshot::Map(prev) = snapshot {
                for (key, item) in entries.iter() {
                    match prev.get_mut(key) {
                        Some(old) => {
                            if !item.identical(old) {
                                count += 1;
                                *old = item.clone();
                            }
                        }
                        None => {
                            count += 1;
                            prev.insert(key.clone(), item.clone());
                        }
                    }
                }
                // Key cardinality detects removals without a second sweep
                // in the common no-removal case.
                if prev.len() > entries.len() {
                    count += 1;
                    prev.retain(|key, _| entries.contains_key(key));
                }
            }
        }
        other => {
            let changed = match &*snapshot {
                Snapshot::Scalar(prev) => !other.identical(prev),
                Snapshot::None => !other.is_null(),
                _ => true,
            };
            if changed {
                count += 1;
            }
            *snapshot = Snapshot::Scalar(other.clone());
        }
    }
    count
}

impl Scope {
    /// Watch a container for shallow content changes. The listener receives
    /// only the current value; no prior-value snapshot is kept.
    pub fn watch_collection(
        &self,
        watch: impl Fn(&Scope) -> Result<Value, BoxError> + 'static,
        listener: impl Fn(&Value, &Scope) -> Result<(), BoxError> + 'static,
    ) -> WatchHandle {
        self.watch_collection_inner(Rc::new(watch), CollectionListener::Current(Rc::new(listener)))
    }

    /// Like [`watch_collection`](Self::watch_collection), with the listener
    /// also receiving the most recent distinct prior value (the current
    /// value itself on the first firing).
    pub fn watch_collection_with_old(
        &self,
        watch: impl Fn(&Scope) -> Result<Value, BoxError> + 'static,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), BoxError> + 'static,
    ) -> WatchHandle {
        self.watch_collection_inner(Rc::new(watch), CollectionListener::WithOld(Rc::new(listener)))
    }

    fn watch_collection_inner(
        &self,
        watch: Rc<WatchFn>,
        listener: CollectionListener,
    ) -> WatchHandle {
        let track_old = matches!(listener, CollectionListener::WithOld(_));
        let state = Rc::new(RefCell::new(CollectionState {
            snapshot: Snapshot::None,
            change_count: 0,
            current: Value::Null,
            previous: Value::Null,
            first_run: true,
        }));

        let internal_watch: Rc<WatchFn> = {
            let state = Rc::clone(&state);
            Rc::new(move |scope| {
                let new_value = watch(scope)?;
                let state = &mut *state.borrow_mut();
                state.change_count = diff(&mut state.snapshot, &new_value, state.change_count);
                state.current = new_value;
                Ok(Value::from(state.change_count as f64))
            })
        };

        let internal_listener: Rc<ListenerFn> = {
            let state = Rc::clone(&state);
            Rc::new(move |_, _, scope| {
                let (current, previous, first_run) = {
                    let state = state.borrow();
                    (state.current.clone(), state.previous.clone(), state.first_run)
                };
                match &listener {
                    CollectionListener::Current(f) => f(&current, scope)?,
                    CollectionListener::WithOld(f) => {
                        let old = if first_run { &current } else { &previous };
                        f(&current, old, scope)?;
                    }
                }
                let mut state = state.borrow_mut();
                state.first_run = false;
                if track_old {
                    state.previous = current.shallow_copy();
                }
                Ok(())
            })
        };

        self.watch_with(internal_watch, internal_listener, false)
    }
}
