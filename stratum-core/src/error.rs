//! Error Types
//!
//! Reading a node can fail in two recoverable ways: the value is not ready
//! yet (asynchronous work is in flight), or the node's computation failed.
//! Both travel to readers through `?`, so a failure deep in the graph shows
//! up on every node that (transitively) observes it.

use std::fmt;
use std::rc::Rc;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced when reading a signal or memo.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The value is temporarily unavailable because asynchronous work is
    /// still in flight. Not a failure: wait for resolution, or read through
    /// [`Runtime::latest`](crate::Runtime::latest).
    #[error("value is not ready")]
    NotReady,

    /// A read reached a node that is itself still evaluating.
    #[error("dependency cycle detected at node {0:?}")]
    Cycle(NodeId),

    /// The computation function failed.
    #[error(transparent)]
    Failed(#[from] Failure),
}

impl Error {
    /// Wrap an arbitrary error as a computation failure.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::Failed(Failure::new(error))
    }

    /// Build a computation failure from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Failed(Failure::msg(message))
    }

    /// Whether this is the "not ready" marker.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }

    /// Identity comparison used to decide whether a re-recorded error is a
    /// change worth propagating.
    pub(crate) fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotReady, Self::NotReady) => true,
            (Self::Cycle(a), Self::Cycle(b)) => a == b,
            (Self::Failed(a), Self::Failed(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// A shared computation failure.
///
/// One failure is handed to every reader of the failed node, so the
/// underlying error lives behind an `Rc` and clones are cheap.
#[derive(Clone)]
pub struct Failure(Rc<dyn std::error::Error + 'static>);

impl Failure {
    /// Wrap an error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self(Rc::new(error))
    }

    /// Build a failure carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(Message(message.to_string()))
    }

    /// Borrow the wrapped error.
    pub fn inner(&self) -> &(dyn std::error::Error + 'static) {
        &*self.0
    }

    /// Attempt to downcast the wrapped error.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn failure_keeps_message_and_type() {
        let err = Error::failed(DiskError);
        assert_eq!(err.to_string(), "disk on fire");

        let Error::Failed(failure) = &err else {
            panic!("expected a failure");
        };
        assert!(failure.downcast_ref::<DiskError>().is_some());
    }

    #[test]
    fn clones_share_identity() {
        let err = Error::msg("boom");
        let copy = err.clone();
        assert!(err.same(&copy));
        assert!(!err.same(&Error::msg("boom")));
        assert!(Error::NotReady.same(&Error::NotReady));
        assert!(Error::NotReady.is_not_ready());
    }
}
