//! Evaluator
//!
//! Reads, writes, recomputation, and teardown. This is where the push half
//! (writes queue subscribers by height) meets the pull half (reads settle
//! whatever is stale before returning).
//!
//! # Borrowing
//!
//! The graph lives in a `RefCell`. User code, meaning computations, cleanup
//! callbacks, and the destructors of values and closures, must never run
//! while it is borrowed: it may read other nodes. Every function here
//! therefore borrows in short blocks and hands replaced values and freed
//! nodes back out to be dropped after the borrow ends.
//!
//! # Reading
//!
//! A read of a derived node that may be stale first runs `mark_heap`, which
//! marks everything queued as `DIRTY` and everything downstream of it as
//! `CHECK`. `update_if_necessary` then walks the node's producers in read
//! order, settling each derived one, and recomputes the node only if one of
//! them actually changed.

use std::mem;

use smallvec::SmallVec;
use tracing::trace;

use super::context::{ContextGuard, EvalContext};
use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{
    AsyncStatus, Cleanup, ComputeFn, EqFn, ErrorRecord, Graph, NodeFlags, NodeId, Outcome,
    Snapshot, Value,
};

impl Runtime {
    /// Read `id` on behalf of the code running right now.
    pub(crate) fn read(&self, id: NodeId) -> Result<Value> {
        let cx = self.inner.context.get();
        {
            let mut graph = self.inner.graph.borrow_mut();
            if graph.flags(id).contains(NodeFlags::RECOMPUTING) {
                return Err(Error::Cycle(id));
            }
            if let Some(observer) = cx.observer {
                if closes_cycle(&graph, id, observer) {
                    return Err(Error::Cycle(id));
                }
                graph.link(id, observer);
                graph.raise_height(id, observer);
            }
        }

        if self.may_be_stale(id) {
            self.mark_heap();
            self.update_if_necessary(id)?;
        }
        self.flush_if_idle();

        let mut snapshot = self.observe(&self.inner.graph.borrow(), id);
        if self.should_retry(id, &snapshot) {
            trace!(node = ?id, "retrying failed evaluation");
            self.recompute(id);
            // The retry may have queued nodes nobody has marked yet.
            self.inner.marked.set(false);
            snapshot = self.observe(&self.inner.graph.borrow(), id);
        }
        self.surface(snapshot, cx)
    }

    /// Turn an observed state into what the reader gets.
    fn surface(&self, snapshot: Snapshot, cx: EvalContext) -> Result<Value> {
        let Snapshot {
            value,
            status,
            error,
            ..
        } = snapshot;

        if status.contains(AsyncStatus::PENDING) {
            let usable = value.filter(|_| !status.contains(AsyncStatus::UNINITIALIZED));
            return match usable {
                Some(value) if cx.reads_latest() => {
                    let mut current = self.inner.context.get();
                    current.saw_pending = true;
                    self.inner.context.set(current);
                    Ok(value)
                }
                _ => Err(Error::NotReady),
            };
        }
        if status.contains(AsyncStatus::ERROR) {
            if let Some(record) = error {
                return Err(record.error);
            }
        }
        value.ok_or(Error::NotReady)
    }

    fn may_be_stale(&self, id: NodeId) -> bool {
        let graph = self.inner.graph.borrow();
        let Some(derived) = graph.node(id).as_derived() else {
            return false;
        };
        let stale = NodeFlags::CHECK | NodeFlags::DIRTY | NodeFlags::IN_HEAP;
        let frontier = self.inner.frontier.get().unwrap_or(0);
        derived.flags.intersects(stale)
            || (!graph.scheduler.is_empty() && derived.height >= frontier)
    }

    /// Whether a recorded error should be retried by this read.
    fn should_retry(&self, id: NodeId, snapshot: &Snapshot) -> bool {
        if !self.inner.config.self_heal || !snapshot.status.contains(AsyncStatus::ERROR) {
            return false;
        }
        let Some(record) = &snapshot.error else {
            return false;
        };
        if !record.retryable || record.time >= self.inner.clock.get() {
            return false;
        }
        let graph = self.inner.graph.borrow();
        let flags = graph.flags(id);
        graph.node(id).is_derived() && !flags.contains(NodeFlags::RECOMPUTING)
    }

    /// Mark every queued node `DIRTY` and everything downstream `CHECK`.
    /// Runs at most once between writes, resolutions, and drains.
    fn mark_heap(&self) {
        if self.inner.marked.replace(true) {
            return;
        }
        let mut graph = self.inner.graph.borrow_mut();
        let graph = &mut *graph;
        for height in 0..=graph.scheduler.max_height() {
            for id in graph.scheduler.bucket(&graph.nodes, height) {
                graph.mark(id, NodeFlags::DIRTY);
            }
        }
    }

    /// Bring `id` up to date, recomputing it only if a producer changed.
    fn update_if_necessary(&self, id: NodeId) -> Result<()> {
        let must_recompute = NodeFlags::DIRTY | NodeFlags::IN_HEAP;
        let (flags, mut cursor) = {
            let graph = self.inner.graph.borrow();
            let derived = graph.derived(id);
            (derived.flags, derived.deps)
        };

        if flags.contains(NodeFlags::CHECK) && !flags.intersects(must_recompute) {
            while let Some(link) = cursor {
                let (dep, dep_flags, is_derived) = {
                    let graph = self.inner.graph.borrow();
                    let Some(edge) = graph.links.get(link) else {
                        break;
                    };
                    let producer = graph.node(edge.dep);
                    (edge.dep, producer.flags(), producer.is_derived())
                };
                if is_derived {
                    if dep_flags.contains(NodeFlags::RECOMPUTING) {
                        return Err(Error::Cycle(dep));
                    }
                    self.update_if_necessary(dep)?;
                }

                let graph = self.inner.graph.borrow();
                if graph.flags(id).intersects(must_recompute) {
                    break;
                }
                cursor = graph.links.get(link).and_then(|edge| edge.next_dep);
            }
        }

        let dirty = self.inner.graph.borrow().flags(id).intersects(must_recompute);
        if dirty {
            self.recompute(id);
        }
        if let Some(derived) = self
            .inner
            .graph
            .borrow_mut()
            .nodes
            .get_mut(id)
            .and_then(|node| node.as_derived_mut())
        {
            derived.flags.remove(NodeFlags::CHECK | NodeFlags::DIRTY);
        }
        Ok(())
    }

    /// Run the computation of `id` and publish its outcome.
    pub(crate) fn recompute(&self, id: NodeId) {
        let cleanups = {
            let mut graph = self.inner.graph.borrow_mut();
            match graph.nodes.get_mut(id).and_then(|node| node.as_derived_mut()) {
                Some(derived) => mem::take(&mut derived.cleanups),
                None => return,
            }
        };
        run_cleanups(cleanups);

        let (compute, prev): (ComputeFn, Option<Value>) = {
            let mut graph = self.inner.graph.borrow_mut();
            graph.unschedule(id);
            let derived = graph.derived_mut(id);
            derived.deps_tail = None;
            derived.flags.remove(NodeFlags::CHECK | NodeFlags::DIRTY);
            derived.flags.insert(NodeFlags::RECOMPUTING);
            let compute = derived.compute.clone();
            (compute, self.observe(&graph, id).value)
        };
        trace!(node = ?id, "recompute");

        let outcome = {
            let _guard = ContextGuard::enter(&self.inner.context, EvalContext::evaluating(id));
            compute(self, id, prev.as_ref())
        };

        let mut orphans = Vec::new();
        let replaced = {
            let mut graph = self.inner.graph.borrow_mut();
            if graph.get(id).is_none() {
                return;
            }
            graph.prune_stale_deps(id, &mut orphans);
            graph.derived_mut(id).flags.remove(NodeFlags::RECOMPUTING);
            self.apply(&mut graph, id, outcome, true)
        };
        drop(replaced);
        drop(prev);
        self.teardown(orphans);
    }

    /// Publish an evaluation or resolution outcome for `id`. Subscribers are
    /// queued only if the observable state changed.
    pub(crate) fn apply(
        &self,
        graph: &mut Graph,
        id: NodeId,
        outcome: Outcome,
        retryable: bool,
    ) -> Option<Snapshot> {
        let clock = self.inner.clock.get();
        let old = self.observe(graph, id);
        if let Some(tx) = self.current_transaction() {
            tx.set_pending(id, matches!(outcome, Outcome::Pending));
        }

        let next = match outcome {
            Outcome::Ready(value) => Snapshot::ready(value, clock),
            Outcome::Pending => {
                let mut status = AsyncStatus::PENDING;
                if old.value.is_none() || old.status.contains(AsyncStatus::UNINITIALIZED) {
                    status |= AsyncStatus::UNINITIALIZED;
                }
                Snapshot {
                    value: old.value.clone(),
                    status,
                    error: None,
                    time: old.time,
                }
            }
            Outcome::Failed(error) => Snapshot {
                value: old.value.clone(),
                status: AsyncStatus::ERROR | AsyncStatus::UNINITIALIZED,
                error: Some(ErrorRecord {
                    error,
                    time: clock,
                    retryable,
                }),
                time: old.time,
            },
        };

        let eq: EqFn = graph.node(id).eq;
        let changed = old.differs_from(&next, eq);
        // An unchanged error is still re-stamped so it is retried at most
        // once per tick.
        let replaced = if changed || next.error.is_some() {
            self.store(graph, id, next)
        } else {
            Some(next)
        };
        if changed {
            graph.schedule_subscribers(id);
        }
        replaced
    }

    /// Write a new value to signal `id`.
    pub(crate) fn write(&self, id: NodeId, value: Value) {
        self.inner.marked.set(false);
        let replaced = {
            let mut graph = self.inner.graph.borrow_mut();
            let current = self.observe(&graph, id);
            let eq = graph.node(id).eq;
            let unchanged = current
                .value
                .as_ref()
                .is_some_and(|old| eq(&**old, &*value));
            if unchanged {
                (Some(current), Some(value))
            } else {
                let clock = self.inner.clock.get();
                let replaced = self.store(&mut graph, id, Snapshot::ready(value, clock));
                graph.schedule_subscribers(id);
                trace!(node = ?id, "signal written");
                (replaced, None)
            }
        };
        drop(replaced);
        self.flush_if_idle();
    }

    /// Attach a cleanup callback to derived node `id`.
    pub(crate) fn add_cleanup(&self, id: NodeId, cleanup: Cleanup) {
        self.inner.graph.borrow_mut().derived_mut(id).cleanups.push(cleanup);
    }

    /// Insert a derived node and evaluate it, unless it is created inside an
    /// evaluation that has not read anything yet: then it shares that
    /// evaluation's height and waits for its first read.
    pub(crate) fn create_derived(
        &self,
        compute: ComputeFn,
        initial: Option<Value>,
        eq: EqFn,
    ) -> NodeId {
        let owner = self.inner.context.get().owner;
        let (id, lazy) = {
            let mut graph = self.inner.graph.borrow_mut();
            let lazy_height = owner.and_then(|owner| {
                let parent = graph.derived(owner);
                parent.deps_tail.is_none().then_some(parent.height)
            });
            let clock = self.inner.clock.get();
            let id = graph.insert_derived(compute, initial, eq, clock);
            if let Some(height) = lazy_height {
                let derived = graph.derived_mut(id);
                derived.height = height;
                derived.flags.insert(NodeFlags::DIRTY);
            }
            (id, lazy_height.is_some())
        };
        if !lazy {
            self.recompute(id);
            self.flush_if_idle();
        }
        id
    }

    /// Drop the caller's claim on `id`. The node is freed as soon as nothing
    /// reads it.
    pub(crate) fn release(&self, id: NodeId) {
        let Ok(mut graph) = self.inner.graph.try_borrow_mut() else {
            self.inner.deferred.borrow_mut().push(id);
            return;
        };
        let Some(node) = graph.nodes.get_mut(id) else {
            return;
        };
        node.released = true;
        let watched = node.is_watched();
        drop(graph);
        if !watched {
            self.teardown(vec![id]);
        }
    }

    /// Tear down nodes that lost their last subscriber, cascading upstream.
    /// Derived nodes are disconnected and marked `DIRTY`; released nodes are
    /// freed.
    pub(crate) fn teardown(&self, mut queue: Vec<NodeId>) {
        while let Some(id) = queue.pop() {
            let (cleanups, freed) = {
                let mut graph = self.inner.graph.borrow_mut();
                let Some(node) = graph.get(id) else {
                    continue;
                };
                if node.is_watched() {
                    continue;
                }
                let released = node.released;
                let mut cleanups = SmallVec::new();
                if node.is_derived() {
                    if node.flags().contains(NodeFlags::RECOMPUTING) {
                        continue;
                    }
                    graph.sever_deps(id, &mut queue);
                    graph.unschedule(id);
                    let derived = graph.derived_mut(id);
                    cleanups = mem::take(&mut derived.cleanups);
                    derived.flags.remove(NodeFlags::CHECK);
                    derived.flags.insert(NodeFlags::DIRTY);
                }
                let freed = if released { graph.remove(id) } else { None };
                (cleanups, freed)
            };
            trace!(node = ?id, freed = freed.is_some(), "teardown");
            run_cleanups(cleanups);
            drop(freed);
        }
    }

    /// Apply releases deferred while the graph was borrowed and publish
    /// resolutions that arrived mid-evaluation, unless a drain or an
    /// evaluation is in progress.
    pub(crate) fn flush_if_idle(&self) {
        let idle =
            self.inner.frontier.get().is_none() && self.inner.context.get().owner.is_none();
        if !idle {
            return;
        }
        if !self.inner.deferred.borrow().is_empty() {
            let deferred = mem::take(&mut *self.inner.deferred.borrow_mut());
            for id in deferred {
                self.release(id);
            }
        }
        loop {
            let next = self.inner.resolutions.borrow_mut().pop_front();
            match next {
                Some(resolution) => self.resolve(resolution),
                None => break,
            }
        }
    }
}

/// Whether linking `dep` into `sub` would close a loop. Only a watched
/// consumer at or below the producer's height can be its own producer.
fn closes_cycle(graph: &Graph, dep: NodeId, sub: NodeId) -> bool {
    let (Some(dep_height), Some(sub_height)) = (graph.node(dep).height(), graph.node(sub).height())
    else {
        return false;
    };
    dep_height >= sub_height && graph.node(sub).is_watched() && graph.depends_on(dep, sub)
}

fn run_cleanups(cleanups: SmallVec<[Cleanup; 1]>) {
    for cleanup in cleanups {
        cleanup();
    }
}
