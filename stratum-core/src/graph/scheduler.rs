//! Height Scheduler
//!
//! The scheduler determines the order in which stale derived nodes are
//! recomputed. It ensures that producers are always settled before their
//! consumers.
//!
//! # Algorithm
//!
//! Every derived node has a *height*: 0 if it reads only signals, otherwise
//! one more than the highest derived node it read. Recomputing in ascending
//! height order is therefore a topological order, and no sorting is needed:
//!
//! 1. The scheduler keeps one bucket per height.
//! 2. Each bucket is a circular doubly-linked ring threaded through the
//!    nodes themselves (`heap_prev` / `heap_next`), so insert and delete are
//!    O(1) and allocation-free.
//! 3. A high-water mark bounds how far a drain has to scan.
//!
//! Membership is guarded by the `IN_HEAP` flag alone, which makes insert
//! and delete idempotent.

use super::arena::Arena;
use super::node::{Node, NodeFlags, NodeId};

/// Buckets of derived nodes awaiting recomputation, indexed by height.
#[derive(Debug)]
pub struct HeightScheduler {
    /// Head of the ring at each height.
    buckets: Vec<Option<NodeId>>,
    /// Greatest height that may be occupied.
    max_height: usize,
    /// Number of scheduled nodes.
    len: usize,
}

impl HeightScheduler {
    /// Create a scheduler with `capacity` preallocated buckets.
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: vec![None; capacity.max(1)],
            max_height: 0,
            len: 0,
        }
    }

    /// Make sure buckets up to `capacity - 1` exist.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.buckets.len() {
            self.buckets.resize(capacity, None);
        }
    }

    /// Enqueue a derived node at its current height. No-op if it is already
    /// scheduled or is not a derived node.
    pub fn insert(&mut self, nodes: &mut Arena<NodeId, Node>, id: NodeId) {
        let Some(derived) = nodes.get_mut(id).and_then(Node::as_derived_mut) else {
            return;
        };
        if derived.flags.contains(NodeFlags::IN_HEAP) {
            return;
        }
        derived.flags.insert(NodeFlags::IN_HEAP);
        let height = derived.height;
        derived.heap_height = height;
        self.reserve(height + 1);

        match self.buckets[height] {
            None => {
                let derived = ring_mut(nodes, id);
                derived.heap_prev = id;
                derived.heap_next = id;
                self.buckets[height] = Some(id);
            }
            Some(head) => {
                let tail = ring(nodes, head).heap_prev;
                ring_mut(nodes, tail).heap_next = id;
                ring_mut(nodes, head).heap_prev = id;
                let derived = ring_mut(nodes, id);
                derived.heap_prev = tail;
                derived.heap_next = head;
            }
        }

        self.max_height = self.max_height.max(height);
        self.len += 1;
    }

    /// Remove a node from its bucket. No-op if it is not scheduled.
    pub fn delete(&mut self, nodes: &mut Arena<NodeId, Node>, id: NodeId) {
        let Some(derived) = nodes.get_mut(id).and_then(Node::as_derived_mut) else {
            return;
        };
        if !derived.flags.contains(NodeFlags::IN_HEAP) {
            return;
        }
        derived.flags.remove(NodeFlags::IN_HEAP);
        let height = derived.heap_height;
        let (prev, next) = (derived.heap_prev, derived.heap_next);
        derived.heap_prev = id;
        derived.heap_next = id;

        if next == id {
            self.buckets[height] = None;
        } else {
            ring_mut(nodes, prev).heap_next = next;
            ring_mut(nodes, next).heap_prev = prev;
            if self.buckets[height] == Some(id) {
                self.buckets[height] = Some(next);
            }
        }
        self.len -= 1;
    }

    /// Head of the bucket at `height`.
    pub fn head(&self, height: usize) -> Option<NodeId> {
        self.buckets.get(height).copied().flatten()
    }

    /// Every node of the bucket at `height`, in ring order.
    pub fn bucket(&self, nodes: &Arena<NodeId, Node>, height: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(head) = self.head(height) else {
            return out;
        };
        let mut cursor = head;
        loop {
            out.push(cursor);
            cursor = ring(nodes, cursor).heap_next;
            if cursor == head {
                break;
            }
        }
        out
    }

    /// Lowest occupied height, if any node is scheduled.
    pub fn lowest(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        (0..=self.max_height).find(|&height| self.head(height).is_some())
    }

    /// Greatest height that may be occupied.
    pub fn max_height(&self) -> usize {
        self.max_height
    }

    /// Forget the high-water mark once every bucket is empty.
    pub fn settle(&mut self) {
        if self.len == 0 {
            self.max_height = 0;
        }
    }

    /// Number of scheduled nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }
}

fn ring(nodes: &Arena<NodeId, Node>, id: NodeId) -> &super::node::Derived {
    nodes[id]
        .as_derived()
        .expect("only derived nodes are scheduled")
}

fn ring_mut(nodes: &mut Arena<NodeId, Node>, id: NodeId) -> &mut super::node::Derived {
    nodes[id]
        .as_derived_mut()
        .expect("only derived nodes are scheduled")
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::graph::node::{value_eq, ComputeFn, Outcome};

    fn derived_at(nodes: &mut Arena<NodeId, Node>, height: usize) -> NodeId {
        let compute: ComputeFn = Rc::new(|_, _, _| Outcome::Pending);
        let id = nodes.insert_with(|id| Node::derived(id, compute, None, value_eq::<()>, 0));
        nodes[id].as_derived_mut().unwrap().height = height;
        id
    }

    #[test]
    fn insert_is_idempotent() {
        let mut nodes = Arena::new();
        let mut scheduler = HeightScheduler::new(4);
        let a = derived_at(&mut nodes, 0);

        scheduler.insert(&mut nodes, a);
        scheduler.insert(&mut nodes, a);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.bucket(&nodes, 0), vec![a]);
        assert!(nodes[a].flags().contains(NodeFlags::IN_HEAP));
    }

    #[test]
    fn ring_keeps_insertion_order() {
        let mut nodes = Arena::new();
        let mut scheduler = HeightScheduler::new(4);
        let ids: Vec<_> = (0..4).map(|_| derived_at(&mut nodes, 2)).collect();
        for &id in &ids {
            scheduler.insert(&mut nodes, id);
        }
        assert_eq!(scheduler.bucket(&nodes, 2), ids);
        assert_eq!(scheduler.max_height(), 2);

        // Remove from the middle, then the head.
        scheduler.delete(&mut nodes, ids[2]);
        assert_eq!(scheduler.bucket(&nodes, 2), vec![ids[0], ids[1], ids[3]]);
        scheduler.delete(&mut nodes, ids[0]);
        assert_eq!(scheduler.head(2), Some(ids[1]));
        assert_eq!(scheduler.bucket(&nodes, 2), vec![ids[1], ids[3]]);
    }

    #[test]
    fn deleting_last_node_empties_bucket() {
        let mut nodes = Arena::new();
        let mut scheduler = HeightScheduler::new(4);
        let a = derived_at(&mut nodes, 1);

        scheduler.insert(&mut nodes, a);
        scheduler.delete(&mut nodes, a);
        scheduler.delete(&mut nodes, a);

        assert!(scheduler.is_empty());
        assert_eq!(scheduler.head(1), None);
        assert_eq!(scheduler.lowest(), None);
        let derived = nodes[a].as_derived().unwrap();
        assert_eq!((derived.heap_prev, derived.heap_next), (a, a));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut nodes = Arena::new();
        let mut scheduler = HeightScheduler::new(2);
        let deep = derived_at(&mut nodes, 10);

        scheduler.insert(&mut nodes, deep);
        assert!(scheduler.capacity() >= 11);
        assert_eq!(scheduler.lowest(), Some(10));
    }

    #[test]
    fn delete_uses_insertion_height() {
        let mut nodes = Arena::new();
        let mut scheduler = HeightScheduler::new(4);
        let a = derived_at(&mut nodes, 1);
        scheduler.insert(&mut nodes, a);

        // Height raised while queued: the node still lives in bucket 1.
        nodes[a].as_derived_mut().unwrap().height = 3;
        scheduler.delete(&mut nodes, a);
        assert_eq!(scheduler.head(1), None);
        assert!(scheduler.is_empty());
    }
}
