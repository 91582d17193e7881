#![forbid(unsafe_code)]

//! Hierarchical reactive scopes with dirty-checking change detection.
//!
//! `quiesce` tracks state without dependency graphs or invalidation wiring:
//! hosts register *watch functions* against arbitrary state on a tree of
//! [`Scope`]s, and a bounded *digest* loop re-evaluates them until the tree
//! is quiescent, invoking listeners exactly when an observed value changed.
//! Around that core sit chain-based attribute inheritance, an upward/
//! downward event bus, and a two-tier scheduler for same-cycle and
//! deferred-coalesced work.
//!
//! Everything is single-threaded and run-to-completion: "asynchronous"
//! means a later turn of the host's own control loop, pumped explicitly
//! through [`Scope::tick`] / [`Scope::run_until_idle`].
//!
//! # Example
//!
//! ```rust
//! use quiesce::Scope;
//!
//! let scope = Scope::new();
//! scope.set("name", "jane");
//!
//! // Derive `upper` from `name`, and `initial` from `upper`. No ordering
//! // or wiring is declared; the digest converges on its own.
//! scope.watch(
//!     |s| Ok(s.get("name")),
//!     |new, _, s| {
//!         s.set("upper", new.as_str().unwrap_or("").to_uppercase());
//!         Ok(())
//!     },
//! );
//! scope.watch(
//!     |s| Ok(s.get("upper")),
//!     |new, _, s| {
//!         if let Some(first) = new.as_str().and_then(|u| u.get(..1)) {
//!             s.set("initial", format!("{first}."));
//!         }
//!         Ok(())
//!     },
//! );
//!
//! scope.digest().unwrap();
//! assert_eq!(scope.get_str("initial").as_deref(), Some("J."));
//!
//! scope.set("name", "bob");
//! scope.digest().unwrap();
//! assert_eq!(scope.get_str("initial").as_deref(), Some("B."));
//! ```
//!
//! # Guarantees
//!
//! 1. A freshly registered watcher fires on the first digest, whatever the
//!    watched value is — including an undefined attribute.
//! 2. A digest either stabilizes within [`MAX_DIGEST_PASSES`] passes or
//!    fails with [`DigestError::Unstable`]; it never loops forever over
//!    watchers alone.
//! 3. One digest-or-apply at a time, tree-wide.
//! 4. Host callback errors are contained at their call site and reported to
//!    the tree's error sink; only [`DigestError`] and [`ApplyError`] escape
//!    engine calls.
//!
//! Expression compilation is out of scope: anything callable as
//! `Fn(&Scope, Option<&Value>) -> Result<Value, BoxError>` works wherever an
//! expression is accepted, and watch functions are plain
//! `Fn(&Scope) -> Result<Value, BoxError>` closures.

mod collection;
mod digest;
mod error;
mod event;
mod scheduler;
mod scope;
mod value;
mod watcher;

pub use digest::MAX_DIGEST_PASSES;
pub use error::{ApplyError, BoxError, CallbackSite, DigestError};
pub use event::{DESTROYED, Event, ListenerHandle};
pub use scheduler::Phase;
pub use scope::Scope;
pub use value::{ListRef, MapRef, Value};
pub use watcher::{GroupHandle, WatchHandle, watch_fn};

/// Watch function shape: a pure read of scope state.
pub type WatchFn = dyn Fn(&Scope) -> Result<Value, BoxError>;

/// Change listener shape: `(new, old, scope)`.
pub type ListenerFn = dyn Fn(&Value, &Value, &Scope) -> Result<(), BoxError>;

/// Expression shape, as produced by an external expression compiler:
/// `(scope, locals)` to a value.
pub type ExprFn = dyn Fn(&Scope, Option<&Value>) -> Result<Value, BoxError>;

/// Event listener shape: `(event, extra args)`.
pub type EventListenerFn = dyn Fn(&Event, &[Value]) -> Result<(), BoxError>;

/// Post-digest callback shape. Runs once, takes nothing.
pub type PostDigestFn = dyn FnOnce() -> Result<(), BoxError>;

/// Receiver for contained callback errors.
pub type ErrorSink = dyn Fn(CallbackSite, &(dyn std::error::Error + 'static));
