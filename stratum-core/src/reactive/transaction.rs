//! Transactions
//!
//! A transaction is an isolated view of the graph. While one is bound (inside
//! [`Transaction::run`]), writes and recomputations land in its *overlay*
//! instead of the nodes, and reads consult the overlay first. Everything
//! outside the transaction, including other transactions, keeps seeing the
//! committed state.
//!
//! A transaction commits at the end of a drain that ran while it was bound,
//! provided none of the nodes it evaluated are still waiting on
//! asynchronous work. Asynchronous resolutions started under a transaction
//! are applied back inside it, so a transaction whose async work is in
//! flight commits as soon as the last resolution settles.
//!
//! # Rebasing
//!
//! The committed graph keeps moving while a transaction waits: other code
//! writes signals and drains. Every overlay entry remembers the clock tick
//! it was written at. On commit, entries whose producers changed outside
//! after that tick are queued again, as are committed subscribers of every
//! node the commit changes, and a drain outside the transaction settles
//! them against the new committed state.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use super::runtime::{Runtime, RuntimeInner};
use crate::graph::{NodeId, Snapshot};

/// Handle to an isolated set of speculative writes.
///
/// Cloning produces another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<TransactionInner>,
    runtime: Weak<RuntimeInner>,
}

struct TransactionInner {
    /// Speculative node states, in first-touched order.
    overlay: RefCell<IndexMap<NodeId, Speculative>>,
    /// Nodes evaluated under this transaction that are waiting on async work.
    pending: RefCell<IndexSet<NodeId>>,
    commits: Cell<u64>,
}

impl Transaction {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Rc::new(TransactionInner {
                overlay: RefCell::new(IndexMap::new()),
                pending: RefCell::new(IndexSet::new()),
                commits: Cell::new(0),
            }),
            runtime: Rc::downgrade(&runtime.inner),
        }
    }

    /// Run `f` with this transaction bound. The previously bound
    /// transaction, if any, is restored afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the runtime that created the transaction has been dropped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let inner = self
            .runtime
            .upgrade()
            .expect("transaction used after its runtime was dropped");
        let _bound = Binding::replace(&inner.transaction, Some(self.clone()));
        f()
    }

    /// Whether every speculative write has been committed.
    pub fn is_committed(&self) -> bool {
        self.inner.overlay.borrow().is_empty()
    }

    /// Number of nodes still waiting on asynchronous work.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Number of times this transaction has committed.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.get()
    }

    /// Whether two handles refer to the same transaction.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Overlay state of `id`, if this transaction has touched it.
    pub(crate) fn observe(&self, id: NodeId) -> Option<Snapshot> {
        self.inner
            .overlay
            .borrow()
            .get(&id)
            .map(|entry| entry.state.clone())
    }

    /// Store a speculative state written at tick `clock`, returning the one
    /// it replaces.
    pub(crate) fn store(&self, id: NodeId, state: Snapshot, clock: u64) -> Option<Snapshot> {
        self.inner
            .overlay
            .borrow_mut()
            .insert(id, Speculative { state, written: clock })
            .map(|entry| entry.state)
    }

    /// Forget everything this transaction holds for `id`.
    pub(crate) fn discard(&self, id: NodeId) -> Option<Snapshot> {
        self.inner.pending.borrow_mut().shift_remove(&id);
        self.inner
            .overlay
            .borrow_mut()
            .shift_remove(&id)
            .map(|entry| entry.state)
    }

    /// Add or remove `id` from the pending set.
    pub(crate) fn set_pending(&self, id: NodeId, pending: bool) {
        let mut set = self.inner.pending.borrow_mut();
        if pending {
            set.insert(id);
        } else {
            set.shift_remove(&id);
        }
    }

    /// Drain the overlay for commit.
    pub(crate) fn take_overlay(&self) -> IndexMap<NodeId, Speculative> {
        self.inner.commits.set(self.inner.commits.get() + 1);
        std::mem::take(&mut *self.inner.overlay.borrow_mut())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("overlay", &self.inner.overlay.borrow().len())
            .field("pending", &self.pending_count())
            .field("commits", &self.commit_count())
            .finish()
    }
}

/// One overlay entry.
pub(crate) struct Speculative {
    pub(crate) state: Snapshot,
    /// Clock tick of the write.
    pub(crate) written: u64,
}

/// Restores the previously bound transaction on drop.
pub(crate) struct Binding<'a> {
    slot: &'a RefCell<Option<Transaction>>,
    saved: Option<Transaction>,
}

impl<'a> Binding<'a> {
    /// Bind `next` (or nothing) until the guard is dropped.
    pub(crate) fn replace(
        slot: &'a RefCell<Option<Transaction>>,
        next: Option<Transaction>,
    ) -> Self {
        let saved = slot.replace(next);
        Self { slot, saved }
    }
}

impl Drop for Binding<'_> {
    fn drop(&mut self) {
        *self.slot.borrow_mut() = self.saved.take();
    }
}
