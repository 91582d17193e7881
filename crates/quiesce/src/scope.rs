#![forbid(unsafe_code)]

//! The scope tree: hierarchical state containers.
//!
//! A [`Scope`] is a cheap `Rc` handle over one node of the tree. Nodes own
//! their children, their watcher list, and their event-listener registry;
//! they hold a non-owning reference to their parent and share a single
//! [`Scheduler`] with the whole tree.
//!
//! Attribute inheritance is chain-based, not prototypal: every node keeps a
//! local overlay map, reads walk an explicit chain-parent link upward until
//! a definition is found, and writes always target the local overlay. A
//! child write therefore shadows without mutating the parent ("write
//! shadowing"), while a parent write stays visible to children that have not
//! shadowed the name. Mutating a *shared container* in place — as opposed to
//! reassigning the attribute — is visible in both directions, because chain
//! and child alias the same container.
//!
//! # Linkage modes
//!
//! - chain-inheriting ([`Scope::child`]): reads fall through to the caller's
//!   attributes.
//! - isolated ([`Scope::isolated_child`]): the overlay starts empty and no
//!   chain walk happens; the node still has a structural parent, sits in the
//!   tree for digest and event traversal, and shares the tree's scheduler.
//!
//! [`Scope::branch`] additionally takes an explicit structural parent, so a
//! node can read one scope's attributes while living (and digesting) under
//! another.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::event::{DESTROYED, EventSlot};
use crate::scheduler::Scheduler;
use crate::value::Value;
use crate::watcher::Watcher;
use crate::{BoxError, ExprFn};

/// One node of the scope tree. Clones share the node.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Rc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    /// Local attribute overlay. Reads that miss fall through to
    /// `chain_parent`; writes always land here.
    pub(crate) attrs: RefCell<AHashMap<String, Value>>,
    /// Read-through link for attribute inheritance. `None` for the root and
    /// for isolated branches.
    pub(crate) chain_parent: Option<Weak<ScopeInner>>,
    /// Structural parent: tree position, event traversal, digest reach.
    pub(crate) parent: Option<Weak<ScopeInner>>,
    /// Owned children in creation order.
    pub(crate) children: RefCell<Vec<Rc<ScopeInner>>>,
    /// Watcher slots; `None` is a tombstone. Appended at the tail, scanned
    /// in index order, never compacted.
    pub(crate) watchers: RefCell<Vec<Option<Rc<Watcher>>>>,
    /// Event listener slots per event name; `None` is a tombstone, swept
    /// during dispatch.
    pub(crate) listeners: RefCell<AHashMap<String, Vec<Option<Rc<EventSlot>>>>>,
    /// The tree root (weak self-reference on the root itself).
    pub(crate) root: Weak<ScopeInner>,
    /// The tree's shared scheduling context, never duplicated.
    pub(crate) sched: Rc<Scheduler>,
    pub(crate) isolated: bool,
}

impl Scope {
    /// Create the root of a new scope tree with a fresh scheduling context.
    #[must_use]
    pub fn new() -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ScopeInner>| ScopeInner {
            attrs: RefCell::new(AHashMap::new()),
            chain_parent: None,
            parent: None,
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            listeners: RefCell::new(AHashMap::new()),
            root: weak.clone(),
            sched: Rc::new(Scheduler::new()),
            isolated: false,
        });
        Self { inner }
    }

    /// Branch a chain-inheriting child of this scope.
    #[must_use]
    pub fn child(&self) -> Scope {
        self.branch(false, None)
    }

    /// Branch an isolated child: empty overlay, no attribute read-through.
    #[must_use]
    pub fn isolated_child(&self) -> Scope {
        self.branch(true, None)
    }

    /// Branch a child of this scope.
    ///
    /// Attribute inheritance (unless `isolated`) always reads through to
    /// *this* scope. `attach_to` chooses the structural parent — the node
    /// whose subtree the child joins for digest and event traversal —
    /// defaulting to this scope. Every branch is appended to its structural
    /// parent's child list and starts with empty watcher and listener lists.
    #[must_use]
    pub fn branch(&self, isolated: bool, attach_to: Option<&Scope>) -> Scope {
        let structural = attach_to.map_or_else(|| self.inner.clone(), |s| s.inner.clone());
        let child = Rc::new(ScopeInner {
            attrs: RefCell::new(AHashMap::new()),
            chain_parent: (!isolated).then(|| Rc::downgrade(&self.inner)),
            parent: Some(Rc::downgrade(&structural)),
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            listeners: RefCell::new(AHashMap::new()),
            // Root and scheduling context follow the structural tree the
            // child joins, not the scope whose attributes it reads.
            root: structural.root.clone(),
            sched: Rc::clone(&structural.sched),
            isolated,
        });
        structural.children.borrow_mut().push(Rc::clone(&child));
        Scope { inner: child }
    }

    /// Detach this scope and its subtree from the tree.
    ///
    /// Broadcasts the reserved [`DESTROYED`] event over the subtree first,
    /// then unlinks the node from its parent's child list, after which no
    /// ancestor-rooted digest or dispatch reaches it again. A no-op on the
    /// root and on a node that was already detached.
    pub fn destroy(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        let attached = parent
            .inner
            .children
            .borrow()
            .iter()
            .any(|c| Rc::ptr_eq(c, &self.inner));
        if !attached {
            return;
        }
        self.broadcast(DESTROYED, &[]);
        parent
            .inner
            .children
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, &self.inner));
    }

    // ---- attributes ----

    /// Read an attribute, walking the inheritance chain. Returns
    /// [`Value::Null`] when no scope on the chain defines it.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        let mut node = Some(Rc::clone(&self.inner));
        while let Some(current) = node {
            if let Some(value) = current.attrs.borrow().get(name) {
                return value.clone();
            }
            node = current.chain_parent.as_ref().and_then(Weak::upgrade);
        }
        Value::Null
    }

    /// Whether any scope on the inheritance chain defines `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let mut node = Some(Rc::clone(&self.inner));
        while let Some(current) = node {
            if current.attrs.borrow().contains_key(name) {
                return true;
            }
            node = current.chain_parent.as_ref().and_then(Weak::upgrade);
        }
        false
    }

    /// Write an attribute into this scope's local overlay. Never touches an
    /// ancestor, even when the name is inherited.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.attrs.borrow_mut().insert(name.into(), value.into());
    }

    /// Numeric attribute shortcut.
    #[must_use]
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get(name).as_number()
    }

    /// String attribute shortcut.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).as_str().map(str::to_owned)
    }

    /// Boolean attribute shortcut.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).as_bool()
    }

    // ---- evaluation ----

    /// Evaluate `expr` against this scope, forwarding `locals` untouched.
    /// The engine adds nothing: the result (or error) is the expression's.
    pub fn eval(
        &self,
        expr: impl FnOnce(&Scope, Option<&Value>) -> Result<Value, BoxError>,
        locals: Option<&Value>,
    ) -> Result<Value, BoxError> {
        expr(self, locals)
    }

    pub(crate) fn eval_queued(&self, expr: &Rc<ExprFn>) -> Result<Value, BoxError> {
        expr(self, None)
    }

    // ---- introspection ----

    /// The structural parent, `None` on the root.
    #[must_use]
    pub fn parent(&self) -> Option<Scope> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Scope { inner })
    }

    /// The tree root (the scope itself when called on the root).
    #[must_use]
    pub fn root(&self) -> Scope {
        match self.inner.root.upgrade() {
            Some(inner) => Scope { inner },
            // The root's Rc is alive as long as any descendant handle is.
            None => self.clone(),
        }
    }

    /// Whether this scope is the tree root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Whether this scope was branched in isolated mode.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.inner.isolated
    }

    /// Number of directly owned children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.children.borrow().len()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    /// Handle equality: two handles are equal when they share the node.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("attrs", &self.inner.attrs.borrow().len())
            .field("children", &self.inner.children.borrow().len())
            .field("isolated", &self.inner.isolated)
            .finish()
    }
}

/// Pre-order walk over `inner` and its subtree. `visit` returns `false` to
/// abort the whole walk; children are re-read through the live list on every
/// step so visits tolerate removal mid-walk.
pub(crate) fn walk(inner: &Rc<ScopeInner>, visit: &mut dyn FnMut(&Rc<ScopeInner>) -> bool) -> bool {
    if !visit(inner) {
        return false;
    }
    let mut idx = 0;
    loop {
        let child = {
            let children = inner.children.borrow();
            match children.get(idx) {
                Some(child) => Rc::clone(child),
                None => break,
            }
        };
        if !walk(&child, visit) {
            return false;
        }
        idx += 1;
    }
    true
}
