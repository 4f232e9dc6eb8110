//! Graph Store
//!
//! Owns every node, every link, and the height scheduler. All structural
//! mutation of the dependency graph goes through this type; the evaluator in
//! [`reactive`](crate::reactive) decides *when* to mutate, this decides
//! *how*.

use std::collections::HashSet;

use super::arena::Arena;
use super::link::{Link, LinkId};
use super::node::{ComputeFn, Derived, EqFn, Node, NodeFlags, NodeId, Value};
use super::scheduler::HeightScheduler;

/// The dependency graph.
#[derive(Debug)]
pub struct Graph {
    pub(crate) nodes: Arena<NodeId, Node>,
    pub(crate) links: Arena<LinkId, Link>,
    pub(crate) scheduler: HeightScheduler,
}

impl Graph {
    /// Create an empty graph with `heap_capacity` preallocated height buckets.
    pub fn new(heap_capacity: usize) -> Self {
        Self {
            nodes: Arena::new(),
            links: Arena::new(),
            scheduler: HeightScheduler::new(heap_capacity),
        }
    }

    /// Add a signal node.
    pub fn insert_signal(&mut self, value: Value, eq: EqFn, time: u64) -> NodeId {
        self.nodes.insert(Node::signal(value, eq, time))
    }

    /// Add a derived node. It starts unscheduled and unevaluated.
    pub fn insert_derived(
        &mut self,
        compute: ComputeFn,
        initial: Option<Value>,
        eq: EqFn,
        time: u64,
    ) -> NodeId {
        self.nodes
            .insert_with(|id| Node::derived(id, compute, initial, eq, time))
    }

    /// Take a node out of the graph. The caller must have severed its edges.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.scheduler.delete(&mut self.nodes, id);
        let node = self.nodes.remove(id)?;
        debug_assert!(node.subs.is_none(), "removed node still has subscribers");
        Some(node)
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Borrow a node if it is still live.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Borrow the derived-node state of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is a signal.
    pub fn derived(&self, id: NodeId) -> &Derived {
        self.nodes[id]
            .as_derived()
            .expect("expected a derived node")
    }

    /// Mutably borrow the derived-node state of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is a signal.
    pub fn derived_mut(&mut self, id: NodeId) -> &mut Derived {
        self.nodes[id]
            .as_derived_mut()
            .expect("expected a derived node")
    }

    /// Scheduling flags of `id` (empty for signals).
    pub fn flags(&self, id: NodeId) -> NodeFlags {
        self.nodes[id].flags()
    }

    /// Enqueue a derived node for the next drain.
    pub fn schedule(&mut self, id: NodeId) {
        self.scheduler.insert(&mut self.nodes, id);
    }

    /// Take a derived node out of the drain queue.
    pub fn unschedule(&mut self, id: NodeId) {
        self.scheduler.delete(&mut self.nodes, id);
    }

    /// Enqueue every subscriber of `id`, promoting `CHECK` to `DIRTY`.
    pub fn schedule_subscribers(&mut self, id: NodeId) {
        let mut cursor = self.nodes[id].subs;
        while let Some(link) = cursor {
            let Link { sub, next_sub, .. } = self.links[link];
            if let Some(derived) = self.nodes[sub].as_derived_mut() {
                if derived.flags.contains(NodeFlags::CHECK) {
                    derived.flags.insert(NodeFlags::DIRTY);
                }
            }
            self.scheduler.insert(&mut self.nodes, sub);
            cursor = next_sub;
        }
    }

    /// Raise `sub`'s height so it sits above derived producer `dep`.
    pub fn raise_height(&mut self, dep: NodeId, sub: NodeId) {
        if let Some(height) = self.nodes[dep].height() {
            let derived = self.derived_mut(sub);
            if height >= derived.height {
                derived.height = height + 1;
            }
        }
    }

    /// Mark `root` with `state` and every transitive subscriber with
    /// `CHECK`. Staleness only ever increases.
    pub fn mark(&mut self, root: NodeId, state: NodeFlags) {
        let mut stack = vec![(root, state)];
        while let Some((id, state)) = stack.pop() {
            let Some(derived) = self.nodes[id].as_derived_mut() else {
                continue;
            };
            if derived.flags.staleness() >= state.staleness() {
                continue;
            }
            derived.flags.insert(state);

            let mut cursor = self.nodes[id].subs;
            while let Some(link) = cursor {
                let link = &self.links[link];
                stack.push((link.sub, NodeFlags::CHECK));
                cursor = link.next_sub;
            }
        }
    }

    /// Whether `target` is a transitive producer of `from`.
    ///
    /// Every node on a path from `target` up to `from` sits strictly above
    /// `target`'s height, so the search never descends below it.
    pub fn depends_on(&self, from: NodeId, target: NodeId) -> bool {
        let Some(floor) = self.nodes[target].height() else {
            return false;
        };
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let mut cursor = self.nodes[id].as_derived().and_then(|derived| derived.deps);
            while let Some(link) = cursor {
                let edge = &self.links[link];
                if edge.dep == target {
                    return true;
                }
                if let Some(height) = self.nodes[edge.dep].height() {
                    if height > floor && seen.insert(edge.dep) {
                        stack.push(edge.dep);
                    }
                }
                cursor = edge.next_dep;
            }
        }
        false
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}
