//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a value written from
//! outside the graph that memos read.
//!
//! # How Signals Work
//!
//! 1. When a signal is read while a memo evaluates, the memo is linked as
//!    a subscriber.
//!
//! 2. When a signal is set to a value that differs from the current one,
//!    its subscribers are queued for the next drain.
//!
//! 3. Setting an equal value does nothing.
//!
//! # Ownership
//!
//! A `Signal<T>` is a handle; clones share the node. The node is freed once
//! every handle is dropped and no memo reads it anymore.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{NodeHandle, Runtime};
use crate::graph::{value_eq, NodeId, Value};

/// A reactive signal holding a value of type `T`.
///
/// # Example
///
/// ```rust
/// use stratum_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.signal(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (queues subscribers)
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T> {
    handle: Rc<NodeHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl Runtime {
    /// Create a new signal with the given initial value.
    pub fn signal<T>(&self, value: T) -> Signal<T>
    where
        T: Clone + PartialEq + 'static,
    {
        let id = self
            .inner
            .graph
            .borrow_mut()
            .insert_signal(Rc::new(value), value_eq::<T>, self.clock());
        Signal {
            handle: NodeHandle::new(self, id),
            _marker: PhantomData,
        }
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// The signal's node.
    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    /// Get the current value.
    ///
    /// If called while a memo evaluates, this also subscribes that memo.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Apply `f` to the current value, tracking the read like [`get`](Self::get).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self
            .handle
            .runtime()
            .read(self.id())
            .expect("signals always hold a value");
        f(downcast(&value))
    }

    /// Get the current value without subscribing the evaluating memo.
    pub fn get_untracked(&self) -> T {
        self.handle.runtime().untrack(|| self.get())
    }

    /// Set a new value. Subscribers are queued only if it differs from the
    /// current one.
    pub fn set(&self, value: T) {
        self.handle.runtime().write(self.id(), Rc::new(value));
    }

    /// Update the value using a function.
    ///
    /// This is useful for updates that depend on the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get_untracked());
        self.set(next);
    }

    /// Clock tick of the last write that changed the value.
    pub fn time(&self) -> u64 {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        rt.observe(&graph, self.id()).time
    }

    /// Get the number of memos reading this signal.
    pub fn subscriber_count(&self) -> usize {
        let rt = self.handle.runtime();
        let graph = rt.inner.graph.borrow();
        graph.subscribers(self.id()).len()
    }
}

pub(crate) fn downcast<T: 'static>(value: &Value) -> &T {
    value
        .downcast_ref::<T>()
        .expect("node holds a value of another type")
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Rc::clone(&self.handle),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Signal<T>
where
    T: Clone + PartialEq + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id())
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_get_set() {
        let rt = Runtime::new();
        let signal = rt.signal(42);
        assert_eq!(signal.get(), 42);

        signal.set(100);
        assert_eq!(signal.get(), 100);
    }

    #[test]
    fn signal_update() {
        let rt = Runtime::new();
        let signal = rt.signal(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_clone_shares_state() {
        let rt = Runtime::new();
        let signal1 = rt.signal(1);
        let signal2 = signal1.clone();

        signal1.set(99);
        assert_eq!(signal2.get(), 99);
        assert_eq!(signal1.id(), signal2.id());
    }

    #[test]
    fn signal_with_borrows_value() {
        let rt = Runtime::new();
        let names = rt.signal(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(names.with(Vec::len), 2);
    }

    #[test]
    fn write_records_clock() {
        let rt = Runtime::new();
        let signal = rt.signal(0);
        rt.stabilize();
        rt.stabilize();

        signal.set(0);
        assert_eq!(signal.time(), 0, "equal write is not a change");
        signal.set(1);
        assert_eq!(signal.time(), 2);
    }

    #[test]
    fn dropping_last_handle_frees_unread_signal() {
        let rt = Runtime::new();
        let signal = rt.signal("x");
        let copy = signal.clone();
        assert_eq!(rt.node_count(), 1);

        drop(signal);
        assert_eq!(rt.node_count(), 1);
        drop(copy);
        assert_eq!(rt.node_count(), 0);
    }

    #[test]
    fn debug_shows_value() {
        let rt = Runtime::new();
        let signal = rt.signal(7_u8);
        let text = format!("{signal:?}");
        assert!(text.contains("value: 7"));
        assert!(text.contains("subscriber_count: 0"));
    }
}
