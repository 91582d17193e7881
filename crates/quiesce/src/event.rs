#![forbid(unsafe_code)]

//! Hierarchical event dispatch: upward emit, downward broadcast.
//!
//! Listeners register per event name on individual scopes. [`Scope::emit`]
//! walks from the originating scope up through its parents; a listener may
//! stop that upward walk, but never suppresses other listeners on the scope
//! currently being visited. [`Scope::broadcast`] visits the originating
//! scope and its whole subtree pre-order — isolated branches included — and
//! cannot be stopped.
//!
//! Deregistration tombstones the listener's slot in place (no index shifts,
//! safe mid-dispatch); dispatch sweeps tombstones as it encounters them.
//! Listener errors are reported to the tree's error sink and never
//! interrupt dispatch.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CallbackSite;
use crate::scope::{self, Scope, ScopeInner};
use crate::value::Value;
use crate::{BoxError, EventListenerFn};

/// Reserved event broadcast over a subtree as it is detached.
pub const DESTROYED: &str = "destroyed";

/// Global counter for unique listener slot ids.
static LISTENER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One registered event listener. `None` in the slot vector is a tombstone.
pub(crate) struct EventSlot {
    pub(crate) id: u64,
    pub(crate) listener: Box<EventListenerFn>,
}

/// A dispatched event, handed to every listener and returned to the caller.
pub struct Event {
    name: String,
    target: Scope,
    current: RefCell<Option<Scope>>,
    /// Upward dispatch only; `stop_propagation` is inert otherwise.
    stoppable: bool,
    stopped: Cell<bool>,
    default_prevented: Cell<bool>,
}

impl Event {
    fn new(name: &str, target: Scope, stoppable: bool) -> Self {
        Self {
            name: name.to_owned(),
            target,
            current: RefCell::new(None),
            stoppable,
            stopped: Cell::new(false),
            default_prevented: Cell::new(false),
        }
    }

    /// The event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scope the dispatch originated on. Fixed for the dispatch's
    /// lifetime.
    #[must_use]
    pub fn target(&self) -> Scope {
        self.target.clone()
    }

    /// The scope whose listeners are currently being invoked; `None` once
    /// dispatch has finished.
    #[must_use]
    pub fn current_scope(&self) -> Option<Scope> {
        self.current.borrow().clone()
    }

    /// Stop the upward walk past the current scope. Listeners already
    /// registered on the current scope still run. Inert during broadcast.
    pub fn stop_propagation(&self) {
        if self.stoppable {
            self.stopped.set(true);
        }
    }

    /// Whether the upward walk was stopped.
    #[must_use]
    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Flag the event's default action as prevented. The engine attaches no
    /// behavior; the caller reads the flag off the returned event.
    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    /// Whether some listener prevented the default action.
    #[must_use]
    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented.get()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("stopped", &self.stopped.get())
            .field("default_prevented", &self.default_prevented.get())
            .finish()
    }
}

/// Deregistration handle for one event listener.
///
/// Explicit, like [`WatchHandle`](crate::WatchHandle): dropping it leaves
/// the listener registered. Idempotent and safe to call mid-dispatch,
/// including from the listener itself.
pub struct ListenerHandle {
    scope: Weak<ScopeInner>,
    name: String,
    id: u64,
}

impl ListenerHandle {
    /// Tombstone the listener's slot in place.
    pub fn deregister(&self) {
        let Some(inner) = self.scope.upgrade() else {
            return;
        };
        let mut listeners = inner.listeners.borrow_mut();
        if let Some(slots) = listeners.get_mut(&self.name) {
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|s| s.id == self.id) {
                    *slot = None;
                    return;
                }
            }
        }
    }
}

impl Scope {
    /// Register a listener for `name` events reaching this scope.
    pub fn on(
        &self,
        name: impl Into<String>,
        listener: impl Fn(&Event, &[Value]) -> Result<(), BoxError> + 'static,
    ) -> ListenerHandle {
        let name = name.into();
        let id = LISTENER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .borrow_mut()
            .entry(name.clone())
            .or_default()
            .push(Some(Rc::new(EventSlot {
                id,
                listener: Box::new(listener),
            })));
        ListenerHandle {
            scope: Rc::downgrade(&self.inner),
            name,
            id,
        }
    }

    /// Dispatch `name` upward: this scope first, then each parent in turn,
    /// until the root is passed or a listener stops propagation. Returns the
    /// event for inspection.
    pub fn emit(&self, name: &str, args: &[Value]) -> Event {
        let event = Event::new(name, self.clone(), true);
        let mut current = Some(self.clone());
        while let Some(scope) = current {
            *event.current.borrow_mut() = Some(scope.clone());
            scope.fire_listeners(name, &event, args);
            if event.stopped.get() {
                break;
            }
            current = scope.parent();
        }
        *event.current.borrow_mut() = None;
        event
    }

    /// Dispatch `name` downward over this scope and its whole subtree in
    /// pre-order. Propagation cannot be stopped. Returns the event.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Event {
        let event = Event::new(name, self.clone(), false);
        scope::walk(&self.inner, &mut |node| {
            let scope = Scope {
                inner: Rc::clone(node),
            };
            *event.current.borrow_mut() = Some(scope.clone());
            scope.fire_listeners(name, &event, args);
            true
        });
        *event.current.borrow_mut() = None;
        event
    }

    /// Invoke every live listener for `name` on this scope, front to back,
    /// sweeping tombstones as encountered. Errors go to the sink.
    fn fire_listeners(&self, name: &str, event: &Event, args: &[Value]) {
        let mut idx = 0;
        loop {
            let entry = {
                let listeners = self.inner.listeners.borrow();
                let Some(slots) = listeners.get(name) else {
                    break;
                };
                if idx >= slots.len() {
                    break;
                }
                slots[idx].clone()
            };
            match entry {
                Some(slot) => {
                    if let Err(err) = (slot.listener)(event, args) {
                        self.inner
                            .sched
                            .report(CallbackSite::EventListener, err.as_ref());
                    }
                    idx += 1;
                }
                None => {
                    let mut listeners = self.inner.listeners.borrow_mut();
                    if let Some(slots) = listeners.get_mut(name) {
                        if idx < slots.len() {
                            slots.remove(idx);
                        }
                    }
                    // Do not advance: the next slot shifted into `idx`.
                }
            }
        }
    }
}
