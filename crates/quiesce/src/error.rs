#![forbid(unsafe_code)]

//! Error taxonomy.
//!
//! Only two structural failures ever escape an engine call: a digest that
//! cannot stabilize, and a digest-or-apply started while another is open.
//! Every other failure — a watch function, a change listener, an event
//! listener, a queued task, a post-digest callback — is contained at its own
//! call site and reported to the tree's error sink together with a
//! [`CallbackSite`] saying where it was caught. A contained error never
//! aborts the loop that caught it.

use std::fmt;

use crate::scheduler::Phase;

/// Boxed error carried by host callbacks.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Structural failures of the digest loop.
#[derive(Debug)]
pub enum DigestError {
    /// The tree was still dirty after the maximum number of digest passes.
    /// This signals a watcher cycle that never stabilizes — a defect in the
    /// registered watchers, not a transient condition to retry.
    Unstable {
        /// Passes executed before giving up.
        passes: usize,
    },
    /// A digest or apply was started while another was already in progress.
    PhaseConflict {
        /// The phase that was already open.
        active: Phase,
    },
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstable { passes } => {
                write!(f, "digest did not stabilize after {passes} passes")
            }
            Self::PhaseConflict { active } => {
                write!(f, "{active} already in progress")
            }
        }
    }
}

impl std::error::Error for DigestError {}

/// Failures escaping [`Scope::apply`](crate::Scope::apply).
#[derive(Debug)]
pub enum ApplyError {
    /// The mandatory digest after the expression failed (takes precedence
    /// over an expression failure).
    Digest(DigestError),
    /// The applied expression itself failed. The digest still ran.
    Expression(BoxError),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(err) => write!(f, "{err}"),
            Self::Expression(err) => write!(f, "applied expression failed: {err}"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Digest(err) => Some(err),
            Self::Expression(err) => Some(err.as_ref()),
        }
    }
}

impl From<DigestError> for ApplyError {
    fn from(err: DigestError) -> Self {
        Self::Digest(err)
    }
}

/// Where a contained callback error was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSite {
    /// A watch function, evaluated during a digest pass.
    WatchFn,
    /// A change listener invoked for a dirty watcher.
    Listener,
    /// An event listener invoked during emit or broadcast.
    EventListener,
    /// A queued task drained by the digest loop or the deferred flush.
    Task,
    /// A post-digest callback.
    PostDigest,
    /// A pending trigger (scheduled digest or coalesced flush) run by the
    /// host pump.
    Trigger,
}

impl fmt::Display for CallbackSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WatchFn => "watch function",
            Self::Listener => "listener",
            Self::EventListener => "event listener",
            Self::Task => "queued task",
            Self::PostDigest => "post-digest callback",
            Self::Trigger => "pending trigger",
        };
        f.write_str(name)
    }
}
