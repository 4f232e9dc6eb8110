//! Memo Implementation
//!
//! A Memo is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Memos Work
//!
//! 1. At creation, the memo runs its computation and caches the result.
//!    Every node it reads becomes a dependency.
//!
//! 2. When a dependency changes, the memo is queued at its height and
//!    recomputed by the next drain, after everything it reads.
//!
//! 3. If the recomputed value equals the cached one, the memo's own
//!    subscribers are left alone (cutoff).
//!
//! 4. A memo read before the drain reaches it settles itself on the spot:
//!    it checks its producers in the order it last read them and recomputes
//!    only if one of them actually changed.
//!
//! # Why This Matters
//!
//! - A signal changes
//! - 10 memos depend on it, through a chain of intermediates
//! - Each memo runs at most once per drain, and never sees a mix of old and
//!   new inputs
//! - A memo whose inputs changed back and forth to the same value does not
//!   disturb anything downstream

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{NodeHandle, Runtime};
use super::signal::downcast;
use crate::error::Result;
use crate::graph::{value_eq, AsyncStatus, ComputeFn, NodeFlags, NodeId, Outcome, Value};

/// Scheduling state of a memo, as last recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoState {
    /// Up to date as far as the runtime knows.
    Clean,
    /// A transitive dependency may have changed.
    Check,
    /// A direct dependency changed, or the memo waits in the drain queue.
    Dirty,
}

/// A memoized computation over other signals and memos.
///
/// # Example
///
/// ```rust
/// use stratum_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.signal(2);
/// let doubled = {
///     let count = count.clone();
///     rt.memo(move |_| Ok(count.get() * 2))
/// };
/// assert_eq!(doubled.get().unwrap(), 4);
///
/// count.set(5);
/// rt.stabilize();
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
pub struct Memo<T> {
    handle: Rc<NodeHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl Runtime {
    /// Create a memo. `f` receives the memo's previous value, if any.
    pub fn memo<T, F>(&self, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<T> + 'static,
    {
        self.memo_inner(None, f)
    }

    /// Create a memo whose first evaluation sees `initial` as the previous
    /// value.
    pub fn memo_with<T, F>(&self, initial: T, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<T> + 'static,
    {
        self.memo_inner(Some(initial), f)
    }

    fn memo_inner<T, F>(&self, initial: Option<T>, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<T> + 'static,
    {
        let compute: ComputeFn = Rc::new(move |_: &Runtime, _: NodeId, prev: Option<&Value>| {
            let prev = prev.and_then(|value| value.downcast_ref::<T>());
            Outcome::from(f(prev).map(|value| Rc::new(value) as Value))
        });
        let initial = initial.map(|value| Rc::new(value) as Value);
        let id = self.create_derived(compute, initial, value_eq::<T>);
        Memo::from_id(self, id)
    }
}

impl<T> Memo<T>
where
    T: Clone + PartialEq + 'static,
{
    pub(crate) fn from_id(runtime: &Runtime, id: NodeId) -> Self {
        Self {
            handle: NodeHandle::new(runtime, id),
            _marker: PhantomData,
        }
    }

    /// The memo's node.
    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    /// Get the current value, settling the memo first if it may be stale.
    ///
    /// If called while another memo evaluates, this also subscribes that
    /// memo.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`](crate::Error::NotReady) while asynchronous work
    /// is in flight, or the error the computation failed with.
    pub fn get(&self) -> Result<T> {
        self.with(T::clone)
    }

    /// Apply `f` to the current value, reading it like [`get`](Self::get).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let value = self.handle.runtime().read(self.id())?;
        Ok(f(downcast(&value)))
    }

    /// Get the current value without subscribing the evaluating memo.
    pub fn get_untracked(&self) -> Result<T> {
        self.handle.runtime().untrack(|| self.get())
    }

    /// The last stored value, without settling or tracking. Includes a
    /// value kept while pending or failed.
    pub fn peek(&self) -> Option<T> {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        rt.observe(&graph, self.id())
            .value
            .map(|value| downcast::<T>(&value).clone())
    }

    /// Whether a value has ever been stored.
    pub fn has_value(&self) -> bool {
        self.peek().is_some()
    }

    /// Topological height.
    pub fn height(&self) -> usize {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        graph.derived(self.id()).height
    }

    /// Clock tick of the last evaluation that produced a value.
    pub fn time(&self) -> u64 {
        self.snapshot_status().1
    }

    /// Scheduling state.
    pub fn state(&self) -> MemoState {
        let rt = self.handle.runtime();
        let flags = rt.inner.graph.borrow().flags(self.id());
        if flags.intersects(NodeFlags::DIRTY | NodeFlags::IN_HEAP) {
            MemoState::Dirty
        } else if flags.contains(NodeFlags::CHECK) {
            MemoState::Check
        } else {
            MemoState::Clean
        }
    }

    /// Nodes read by the last evaluation, in read order.
    pub fn dependencies(&self) -> Vec<NodeId> {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        graph.dependencies(self.id())
    }

    /// Number of memos reading this one.
    pub fn subscriber_count(&self) -> usize {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        graph.subscribers(self.id()).len()
    }

    /// Whether the memo waits on asynchronous work.
    pub fn is_pending(&self) -> bool {
        self.snapshot_status().0.contains(AsyncStatus::PENDING)
    }

    /// Whether the last evaluation or resolution failed.
    pub fn is_errored(&self) -> bool {
        self.snapshot_status().0.contains(AsyncStatus::ERROR)
    }

    fn snapshot_status(&self) -> (AsyncStatus, u64) {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        let snapshot = rt.observe(&graph, self.id());
        (snapshot.status, snapshot.time)
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Rc::clone(&self.handle),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Memo<T>
where
    T: Clone + PartialEq + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id())
            .field("value", &self.peek())
            .field("state", &self.state())
            .field("height", &self.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::Error;

    fn counter() -> (Rc<Cell<i32>>, Rc<Cell<i32>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[test]
    fn memo_computes_at_creation() {
        let rt = Runtime::new();
        let (calls, calls_inner) = counter();

        let memo = rt.memo(move |_| {
            calls_inner.set(calls_inner.get() + 1);
            Ok(42)
        });

        assert!(memo.has_value());
        assert_eq!(calls.get(), 1);
        assert_eq!(memo.get().unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn memo_caches_value_when_clean() {
        let rt = Runtime::new();
        let (calls, calls_inner) = counter();
        let memo = rt.memo(move |_| {
            calls_inner.set(calls_inner.get() + 1);
            Ok(42)
        });

        for _ in 0..3 {
            assert_eq!(memo.get().unwrap(), 42);
        }
        rt.stabilize();
        assert_eq!(memo.get().unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn memo_recomputes_when_dependency_changes() {
        let rt = Runtime::new();
        let (calls, calls_inner) = counter();
        let source = rt.signal(0);
        let memo = {
            let source = source.clone();
            rt.memo(move |_| {
                calls_inner.set(calls_inner.get() + 1);
                Ok(source.get() + 1)
            })
        };

        source.set(5);
        assert_eq!(memo.state(), MemoState::Dirty);
        rt.stabilize();
        assert_eq!(memo.state(), MemoState::Clean);
        assert_eq!(memo.get().unwrap(), 6);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn stale_memo_settles_on_read() {
        let rt = Runtime::new();
        let source = rt.signal(1);
        let memo = {
            let source = source.clone();
            rt.memo(move |_| Ok(source.get() * 3))
        };

        source.set(2);
        // No drain yet: the read settles the memo itself.
        assert_eq!(memo.get().unwrap(), 6);
        assert_eq!(rt.scheduled_count(), 0);
    }

    #[test]
    fn memo_clone_shares_state() {
        let rt = Runtime::new();
        let memo1 = rt.memo(|_| Ok(42));
        let memo2 = memo1.clone();

        assert_eq!(memo1.id(), memo2.id());
        assert!(memo2.has_value());
        assert_eq!(memo2.get().unwrap(), 42);
    }

    #[test]
    fn previous_value_is_passed_in() {
        let rt = Runtime::new();
        let tick = rt.signal(0);
        let total = {
            let tick = tick.clone();
            rt.memo_with(10, move |prev| Ok(prev.copied().unwrap_or(0) + tick.get()))
        };
        assert_eq!(total.get().unwrap(), 10);

        tick.set(1);
        rt.stabilize();
        assert_eq!(total.get().unwrap(), 11);
    }

    #[test]
    fn failure_is_reported_and_kept() {
        let rt = Runtime::new();
        let memo = rt.memo::<i32, _>(|_| Err(Error::msg("nope")));

        assert!(memo.is_errored());
        assert!(!memo.is_pending());
        let err = memo.get().unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn dependencies_follow_read_order() {
        let rt = Runtime::new();
        let a = rt.signal(1);
        let b = rt.signal(2);
        let sum = {
            let (a, b) = (a.clone(), b.clone());
            rt.memo(move |_| Ok(b.get() + a.get()))
        };

        assert_eq!(sum.dependencies(), vec![b.id(), a.id()]);
        assert_eq!(a.subscriber_count(), 1);
        assert_eq!(sum.height(), 0);
    }
}
