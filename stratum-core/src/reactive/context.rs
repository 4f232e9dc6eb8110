//! Evaluation Context
//!
//! The evaluation context records which derived node is currently running.
//! This enables automatic dependency tracking: when a node is read, the
//! runtime links it to the current observer.
//!
//! # Implementation
//!
//! The context lives in a `Cell` on the runtime. Entering a new context
//! returns a guard holding the previous one; dropping the guard restores it.
//! Nested evaluations (a memo reading a stale memo that recomputes on the
//! spot) therefore unwind correctly, even if a computation panics.

use std::cell::Cell;

use crate::graph::NodeId;

/// What the runtime knows about the code that is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalContext {
    /// Node whose reads are being recorded as dependencies.
    pub observer: Option<NodeId>,
    /// Node that owns cleanups registered right now. Same as `observer`
    /// except inside [`Runtime::untrack`](crate::Runtime::untrack).
    pub owner: Option<NodeId>,
    /// Depth of nested `latest` scopes.
    pub latest: u32,
    /// A `latest` read returned a stale value in place of a pending one.
    pub saw_pending: bool,
}

impl EvalContext {
    /// Context of a derived node's own evaluation.
    pub fn evaluating(node: NodeId) -> Self {
        Self {
            observer: Some(node),
            owner: Some(node),
            latest: 0,
            saw_pending: false,
        }
    }

    /// Same context, with dependency tracking switched off.
    pub fn untracked(self) -> Self {
        Self {
            observer: None,
            ..self
        }
    }

    /// Same context, one `latest` scope deeper.
    pub fn in_latest(self) -> Self {
        Self {
            latest: self.latest + 1,
            ..self
        }
    }

    /// Whether pending values are being read through.
    pub fn reads_latest(&self) -> bool {
        self.latest > 0
    }
}

/// Guard that restores the previous context when dropped.
pub struct ContextGuard<'a> {
    cell: &'a Cell<EvalContext>,
    saved: EvalContext,
}

impl<'a> ContextGuard<'a> {
    /// Replace the current context with `next` until the guard is dropped.
    pub fn enter(cell: &'a Cell<EvalContext>, next: EvalContext) -> Self {
        let saved = cell.replace(next);
        Self { cell, saved }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.cell.set(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::arena::ArenaKey;

    fn id(index: u32) -> NodeId {
        NodeId::from_parts(index, 0)
    }

    #[test]
    fn context_tracks_observer() {
        let cell = Cell::new(EvalContext::default());
        assert_eq!(cell.get().observer, None);

        {
            let _guard = ContextGuard::enter(&cell, EvalContext::evaluating(id(1)));
            assert_eq!(cell.get().observer, Some(id(1)));
            assert_eq!(cell.get().owner, Some(id(1)));
        }

        assert_eq!(cell.get(), EvalContext::default());
    }

    #[test]
    fn nested_contexts() {
        let cell = Cell::new(EvalContext::default());
        {
            let _outer = ContextGuard::enter(&cell, EvalContext::evaluating(id(1)));
            {
                let _inner = ContextGuard::enter(&cell, EvalContext::evaluating(id(2)));
                assert_eq!(cell.get().observer, Some(id(2)));
            }
            assert_eq!(cell.get().observer, Some(id(1)));
        }
        assert_eq!(cell.get().observer, None);
    }

    #[test]
    fn untracked_keeps_owner() {
        let cx = EvalContext::evaluating(id(3)).untracked();
        assert_eq!(cx.observer, None);
        assert_eq!(cx.owner, Some(id(3)));
    }

    #[test]
    fn latest_scopes_nest() {
        let cx = EvalContext::default();
        assert!(!cx.reads_latest());
        let cx = cx.in_latest().in_latest();
        assert_eq!(cx.latest, 2);
        assert!(cx.reads_latest());
        assert!(!EvalContext::evaluating(id(0)).reads_latest());
    }

    #[test]
    fn guard_restores_after_panic() {
        let cell = Cell::new(EvalContext::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ContextGuard::enter(&cell, EvalContext::evaluating(id(7)));
            panic!("computation blew up");
        }));
        assert!(result.is_err());
        assert_eq!(cell.get().observer, None);
    }
}
