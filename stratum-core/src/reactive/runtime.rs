//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals and memos.
//! It owns the dependency graph and drives updates when signals change.
//!
//! # How It Works
//!
//! 1. When a signal is written, its subscribers are queued by height.
//!
//! 2. [`Runtime::stabilize`] drains the queue in ascending height order.
//!    Each recomputed memo that actually changed queues its own
//!    subscribers, which sit higher up and are reached later in the same
//!    drain.
//!
//! 3. Reads settle stale memos on demand, so a memo read before the drain
//!    gets to it still returns an up-to-date value.
//!
//! 4. The logical clock advances by one at the end of every drain.
//!
//! # Threading
//!
//! A runtime is single-threaded (`!Send`). Concurrency comes only from
//! asynchronous resolutions, which run as local tasks on the same thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::{debug, debug_span, trace, warn};

use super::async_memo::{Resolution, Spawn, TokioSpawner};
use super::context::{ContextGuard, EvalContext};
use super::transaction::{Binding, Speculative, Transaction};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, Snapshot};

/// Handle to one independent reactive graph.
///
/// Cloning is cheap and yields another handle to the same graph.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    pub(crate) graph: RefCell<Graph>,
    pub(crate) config: RuntimeConfig,
    pub(crate) spawner: Box<dyn Spawn>,
    pub(crate) context: Cell<EvalContext>,
    /// Logical clock; advanced at the end of every drain.
    pub(crate) clock: Cell<u64>,
    /// `mark_heap` already ran since the last write, resolution, or drain.
    pub(crate) marked: Cell<bool>,
    /// Height currently being drained, while a drain is running.
    pub(crate) frontier: Cell<Option<usize>>,
    pub(crate) transaction: RefCell<Option<Transaction>>,
    /// Handles dropped while the graph was borrowed.
    pub(crate) deferred: RefCell<Vec<NodeId>>,
    /// Flight results that arrived while the runtime was busy.
    pub(crate) resolutions: RefCell<VecDeque<Resolution>>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_spawner(config, TokioSpawner)
    }

    /// Create a runtime that hands asynchronous work to `spawner`.
    pub fn with_spawner(config: RuntimeConfig, spawner: impl Spawn + 'static) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                graph: RefCell::new(Graph::new(config.heap_capacity)),
                config,
                spawner: Box::new(spawner),
                context: Cell::new(EvalContext::default()),
                clock: Cell::new(0),
                marked: Cell::new(false),
                frontier: Cell::new(None),
                transaction: RefCell::new(None),
                deferred: RefCell::new(Vec::new()),
                resolutions: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Recompute every queued memo, lowest height first.
    ///
    /// Afterwards the bound transaction, if any, commits when none of its
    /// nodes wait on asynchronous work, and the clock advances.
    pub fn stabilize(&self) {
        let inner = &*self.inner;
        if inner.frontier.get().is_some() {
            warn!("stabilize called during a drain; ignoring");
            return;
        }
        let _span = debug_span!("stabilize", clock = inner.clock.get()).entered();
        inner.marked.set(false);

        let mut recomputed = self.drain();
        if let Some(tx) = self.current_transaction() {
            if tx.pending_count() == 0 && !tx.is_committed() {
                self.commit(&tx);
                // What the commit queued settles against committed state.
                let _unbound = Binding::replace(&inner.transaction, None);
                inner.marked.set(false);
                recomputed += self.drain();
            }
        }
        inner.clock.set(inner.clock.get() + 1);
        self.flush_if_idle();
        debug!(recomputed, "drain complete");
    }

    /// Run the height loop until the queue is empty. Returns the number of
    /// recomputations.
    fn drain(&self) -> usize {
        let inner = &*self.inner;
        let mut recomputed = 0_usize;
        let mut height = 0;
        loop {
            let head = {
                let graph = inner.graph.borrow();
                if height > graph.scheduler.max_height() {
                    // A recompute may have queued work below the frontier.
                    match graph.scheduler.lowest() {
                        Some(lowest) => {
                            height = lowest;
                            graph.scheduler.head(lowest)
                        }
                        None => break,
                    }
                } else {
                    graph.scheduler.head(height)
                }
            };
            inner.frontier.set(Some(height));
            match head {
                Some(id) => {
                    self.recompute(id);
                    recomputed += 1;
                }
                None => height += 1,
            }
        }
        inner.frontier.set(None);
        inner.graph.borrow_mut().scheduler.settle();
        recomputed
    }

    /// Read through pending values: inside `f`, a memo waiting on async work
    /// returns its previous value instead of [`Error::NotReady`] when it has
    /// one.
    pub fn latest<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let cx = self.inner.context.get();
        let _guard = ContextGuard::enter(&self.inner.context, cx.in_latest());
        f()
    }

    /// Like [`latest`](Self::latest), but yields `fallback` if a value is
    /// still not available.
    pub fn latest_or<R>(&self, fallback: R, f: impl FnOnce() -> Result<R>) -> Result<R> {
        match self.latest(f) {
            Err(Error::NotReady) => Ok(fallback),
            other => other,
        }
    }

    /// Whether `f` observed a pending value that it read through.
    ///
    /// `f` runs as in [`latest`](Self::latest). Reads that have no previous
    /// value to fall back on still fail with [`Error::NotReady`].
    pub fn is_pending<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<bool> {
        let cx = self.inner.context.get();
        let scoped = EvalContext {
            saw_pending: false,
            ..cx.in_latest()
        };
        let (result, saw) = {
            let _guard = ContextGuard::enter(&self.inner.context, scoped);
            let result = f();
            (result, self.inner.context.get().saw_pending)
        };
        if saw {
            let mut outer = self.inner.context.get();
            outer.saw_pending = true;
            self.inner.context.set(outer);
        }
        result.map(|_| saw)
    }

    /// Run `f` without recording dependencies on what it reads.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        let cx = self.inner.context.get();
        let _guard = ContextGuard::enter(&self.inner.context, cx.untracked());
        f()
    }

    /// Register `f` to run before the evaluating memo's next evaluation, or
    /// when it is torn down.
    ///
    /// # Panics
    ///
    /// Panics if no memo is evaluating.
    pub fn on_cleanup(&self, f: impl FnOnce() + 'static) {
        let owner = self
            .inner
            .context
            .get()
            .owner
            .expect("on_cleanup called outside of a memo evaluation");
        self.add_cleanup(owner, Box::new(f));
    }

    /// Create a new transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self)
    }

    /// The transaction bound by the innermost [`Transaction::run`].
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.transaction.borrow().clone()
    }

    /// Preallocate scheduler buckets for heights below `heights`.
    pub fn reserve_heights(&self, heights: usize) {
        self.inner.graph.borrow_mut().scheduler.reserve(heights);
    }

    /// Current logical clock.
    pub fn clock(&self) -> u64 {
        self.inner.clock.get()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.inner.graph.borrow().node_count()
    }

    /// Number of live dependency edges.
    pub fn link_count(&self) -> usize {
        self.inner.graph.borrow().link_count()
    }

    /// Number of memos queued for the next drain.
    pub fn scheduled_count(&self) -> usize {
        self.inner.graph.borrow().scheduler.len()
    }

    /// State of `id` as seen by the code running right now.
    pub(crate) fn observe(&self, graph: &Graph, id: NodeId) -> Snapshot {
        if let Some(tx) = self.inner.transaction.borrow().as_ref() {
            if let Some(snapshot) = tx.observe(id) {
                return snapshot;
            }
        }
        graph.node(id).state.clone()
    }

    /// Store the state of `id`, into the bound transaction if there is one.
    /// Returns the replaced state so the caller can drop it unborrowed.
    pub(crate) fn store(
        &self,
        graph: &mut Graph,
        id: NodeId,
        snapshot: Snapshot,
    ) -> Option<Snapshot> {
        match self.current_transaction() {
            Some(tx) => tx.store(id, snapshot, self.inner.clock.get()),
            None => Some(mem::replace(&mut graph.node_mut(id).state, snapshot)),
        }
    }

    /// Copy `tx`'s overlay into the nodes and queue whatever the committed
    /// graph has to recompute because of it.
    fn commit(&self, tx: &Transaction) {
        let overlay = tx.take_overlay();
        let mut replaced = Vec::with_capacity(overlay.len());
        let mut requeued = 0_usize;
        {
            let mut graph = self.inner.graph.borrow_mut();
            let graph = &mut *graph;
            let outdated: Vec<NodeId> = overlay
                .iter()
                .filter(|(id, entry)| producers_moved(graph, &overlay, **id, entry.written))
                .map(|(id, _)| *id)
                .collect();

            for (id, entry) in &overlay {
                let Some(node) = graph.nodes.get_mut(*id) else {
                    continue;
                };
                let changed = node.state.differs_from(&entry.state, node.eq);
                replaced.push(mem::replace(&mut node.state, entry.state.clone()));
                if !changed {
                    continue;
                }
                // Subscribers inside the overlay already saw this state.
                for sub in graph.subscribers(*id) {
                    if !overlay.contains_key(&sub) {
                        graph.scheduler.insert(&mut graph.nodes, sub);
                        requeued += 1;
                    }
                }
            }
            for id in outdated {
                graph.scheduler.insert(&mut graph.nodes, id);
                requeued += 1;
            }
        }
        trace!(nodes = overlay.len(), requeued, "transaction committed");
        drop(replaced);
        drop(overlay);
    }
}

/// Whether a producer of overlay entry `id`, written at tick `written`,
/// changed in the committed graph since.
fn producers_moved(
    graph: &Graph,
    overlay: &IndexMap<NodeId, Speculative>,
    id: NodeId,
    written: u64,
) -> bool {
    if !graph.get(id).is_some_and(|node| node.is_derived()) {
        return false;
    }
    graph
        .dependencies(id)
        .into_iter()
        .filter(|dep| !overlay.contains_key(dep))
        .any(|dep| graph.node(dep).state.changed_since(written))
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("clock", &self.clock())
            .field("nodes", &self.node_count())
            .field("links", &self.link_count())
            .field("scheduled", &self.scheduled_count())
            .finish()
    }
}

/// Keeps a node alive on behalf of a typed handle.
///
/// Dropping the last handle releases the node; it is freed once nothing
/// reads it anymore.
pub(crate) struct NodeHandle {
    runtime: Weak<RuntimeInner>,
    pub(crate) id: NodeId,
}

impl NodeHandle {
    pub(crate) fn new(runtime: &Runtime, id: NodeId) -> Rc<Self> {
        Rc::new(Self {
            runtime: Rc::downgrade(&runtime.inner),
            id,
        })
    }

    /// # Panics
    ///
    /// Panics if the runtime has been dropped.
    pub(crate) fn runtime(&self) -> Runtime {
        Runtime {
            inner: self
                .runtime
                .upgrade()
                .expect("handle used after its runtime was dropped"),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.runtime.upgrade() {
            Runtime { inner }.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_per_drain() {
        let rt = Runtime::new();
        assert_eq!(rt.clock(), 0);
        rt.stabilize();
        rt.stabilize();
        assert_eq!(rt.clock(), 2);
    }

    #[test]
    fn heap_capacity_comes_from_config() {
        let rt = Runtime::with_config(RuntimeConfig {
            heap_capacity: 16,
            ..RuntimeConfig::default()
        });
        assert_eq!(rt.inner.graph.borrow().scheduler.capacity(), 16);
        rt.reserve_heights(64);
        assert_eq!(rt.inner.graph.borrow().scheduler.capacity(), 64);
    }

    #[test]
    fn latest_or_falls_back_on_not_ready() {
        let rt = Runtime::new();
        assert!(matches!(rt.latest_or(7, || Err(Error::NotReady)), Ok(7)));
        assert!(matches!(rt.latest_or(7, || Err(Error::msg("boom"))), Err(Error::Failed(_))));
        assert!(matches!(rt.latest_or(7, || Ok(1)), Ok(1)));
    }

    #[test]
    fn is_pending_without_reads_is_false() {
        let rt = Runtime::new();
        assert!(!rt.is_pending(|| Ok(())).unwrap());
        assert!(rt.is_pending(|| Err::<(), _>(Error::NotReady)).unwrap_err().is_not_ready());
    }

    #[test]
    #[should_panic(expected = "outside of a memo evaluation")]
    fn cleanup_outside_evaluation_panics() {
        let rt = Runtime::new();
        rt.on_cleanup(|| {});
    }

    #[test]
    fn debug_lists_counters() {
        let rt = Runtime::new();
        let _s = rt.signal(1);
        let text = format!("{rt:?}");
        assert!(text.contains("nodes: 1"));
    }
}
