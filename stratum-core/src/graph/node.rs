//! Graph Nodes
//!
//! This module defines the two kinds of node that live in the dependency
//! graph and the per-node state the evaluator works with.
//!
//! - A *signal* is a leaf written from outside the graph.
//! - A *derived* node caches the result of a computation over other nodes.
//!   It is both a producer (others read it) and a consumer (it reads others).
//!
//! Values are stored type-erased; each node carries the equality function of
//! its concrete type so the evaluator can detect unchanged results.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use smallvec::SmallVec;

use super::arena::arena_key;
use super::link::LinkId;
use crate::error::Error;
use crate::reactive::Runtime;

arena_key! {
    /// Generation-checked identifier of a node in the dependency graph.
    pub struct NodeId;
}

/// A type-erased node value.
pub type Value = Rc<dyn Any>;

/// Equality over type-erased values of one concrete type.
pub type EqFn = fn(&dyn Any, &dyn Any) -> bool;

/// Build the [`EqFn`] for `T`.
pub fn value_eq<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// What a single evaluation of a derived node produced.
pub enum Outcome {
    /// A fresh value.
    Ready(Value),
    /// The value is not available yet; asynchronous work is in flight.
    Pending,
    /// The computation failed.
    Failed(Error),
}

impl From<Result<Value, Error>> for Outcome {
    fn from(result: Result<Value, Error>) -> Self {
        match result {
            Ok(value) => Self::Ready(value),
            Err(Error::NotReady) => Self::Pending,
            Err(err) => Self::Failed(err),
        }
    }
}

/// Type-erased computation of a derived node.
///
/// Receives the runtime, the node's own id, and its previous value.
pub type ComputeFn = Rc<dyn Fn(&Runtime, NodeId, Option<&Value>) -> Outcome>;

/// Callback run before a derived node's next evaluation or on teardown.
pub type Cleanup = Box<dyn FnOnce()>;

bitflags! {
    /// Scheduling state of a derived node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// A transitive producer may have changed; confirm before use.
        const CHECK = 1 << 0;
        /// A direct producer changed; the node must recompute.
        const DIRTY = 1 << 1;
        /// The node's computation is running right now.
        const RECOMPUTING = 1 << 2;
        /// The node sits in a height bucket waiting for the drain.
        const IN_HEAP = 1 << 3;
    }
}

impl NodeFlags {
    /// The staleness part of the flags, ordered Clean < Check < Dirty.
    pub fn staleness(self) -> u8 {
        (self & (Self::CHECK | Self::DIRTY)).bits()
    }
}

bitflags! {
    /// Availability of a node's value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AsyncStatus: u8 {
        /// Waiting on asynchronous work.
        const PENDING = 1 << 0;
        /// The last evaluation failed.
        const ERROR = 1 << 1;
        /// No usable value has been produced.
        const UNINITIALIZED = 1 << 2;
    }
}

/// An error recorded on a node.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// The error handed to readers.
    pub error: Error,
    /// Clock tick at which it was recorded.
    pub time: u64,
    /// Whether a read in a later tick may retry the computation. Errors
    /// delivered by an asynchronous resolution are not retried.
    pub retryable: bool,
}

/// The observable state of a node: what a reader sees.
///
/// Transactions keep their own copy of this per node, so the committed and
/// speculative states of a node have the same shape.
#[derive(Clone, Default)]
pub struct Snapshot {
    /// Last produced value, if any.
    pub value: Option<Value>,
    /// Availability of the value.
    pub status: AsyncStatus,
    /// Error recorded by the last failed evaluation or resolution.
    pub error: Option<ErrorRecord>,
    /// Clock tick of the last change.
    pub time: u64,
}

impl Snapshot {
    /// State of a node that holds `value` as of `time`.
    pub fn ready(value: Value, time: u64) -> Self {
        Self {
            value: Some(value),
            status: AsyncStatus::empty(),
            error: None,
            time,
        }
    }

    /// Whether a value or an error was recorded at tick `clock` or later.
    pub fn changed_since(&self, clock: u64) -> bool {
        self.time >= clock || self.error.as_ref().is_some_and(|record| record.time >= clock)
    }

    /// Whether switching from `self` to `next` is visible to readers.
    pub fn differs_from(&self, next: &Snapshot, eq: EqFn) -> bool {
        if self.status != next.status {
            return true;
        }
        let value_changed = match (&self.value, &next.value) {
            (Some(old), Some(new)) => !Rc::ptr_eq(old, new) && !eq(&**old, &**new),
            (None, None) => false,
            _ => true,
        };
        let error_changed = match (&self.error, &next.error) {
            (Some(old), Some(new)) => !old.error.same(&new.error),
            (None, None) => false,
            _ => true,
        };
        value_changed || error_changed
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("has_value", &self.value.is_some())
            .field("status", &self.status)
            .field("error", &self.error)
            .field("time", &self.time)
            .finish()
    }
}

/// State only derived nodes carry.
pub struct Derived {
    /// First dependency edge, in read order.
    pub deps: Option<LinkId>,
    /// Last dependency edge confirmed by the current (or last) evaluation.
    pub deps_tail: Option<LinkId>,
    /// Scheduling flags.
    pub flags: NodeFlags,
    /// Topological stratum: 1 + the highest derived producer's height.
    pub height: usize,
    /// Bucket the node was inserted into; valid while `IN_HEAP` is set.
    pub heap_height: usize,
    /// Ring neighbours inside the height bucket. A lone node points at itself.
    pub heap_prev: NodeId,
    pub heap_next: NodeId,
    /// Callbacks registered by the last evaluation.
    pub cleanups: SmallVec<[Cleanup; 1]>,
    /// The computation.
    pub compute: ComputeFn,
}

/// The closed set of node kinds.
pub enum NodeKind {
    /// An externally written leaf.
    Signal,
    /// A memoized computation.
    Derived(Box<Derived>),
}

/// A node in the dependency graph.
pub struct Node {
    /// Signal or derived.
    pub kind: NodeKind,
    /// Committed state.
    pub state: Snapshot,
    /// First subscriber edge, in order of attachment.
    pub subs: Option<LinkId>,
    /// Last subscriber edge.
    pub subs_tail: Option<LinkId>,
    /// Equality of the node's value type.
    pub eq: EqFn,
    /// Every external handle is gone; free the node once nothing reads it.
    pub released: bool,
}

impl Node {
    /// Create a signal node holding `value`.
    pub fn signal(value: Value, eq: EqFn, time: u64) -> Self {
        Self {
            kind: NodeKind::Signal,
            state: Snapshot::ready(value, time),
            subs: None,
            subs_tail: None,
            eq,
            released: false,
        }
    }

    /// Create a derived node. `id` is the node's own key so its height ring
    /// can start as a self-loop.
    pub fn derived(
        id: NodeId,
        compute: ComputeFn,
        initial: Option<Value>,
        eq: EqFn,
        time: u64,
    ) -> Self {
        let state = match initial {
            Some(value) => Snapshot::ready(value, time),
            None => Snapshot {
                value: None,
                status: AsyncStatus::UNINITIALIZED,
                error: None,
                time,
            },
        };
        Self {
            kind: NodeKind::Derived(Box::new(Derived {
                deps: None,
                deps_tail: None,
                flags: NodeFlags::empty(),
                height: 0,
                heap_height: 0,
                heap_prev: id,
                heap_next: id,
                cleanups: SmallVec::new(),
                compute,
            })),
            state,
            subs: None,
            subs_tail: None,
            eq,
            released: false,
        }
    }

    /// Whether this is a derived node.
    pub fn is_derived(&self) -> bool {
        matches!(self.kind, NodeKind::Derived(_))
    }

    /// Borrow the derived-node state, if any.
    pub fn as_derived(&self) -> Option<&Derived> {
        match &self.kind {
            NodeKind::Derived(derived) => Some(derived),
            NodeKind::Signal => None,
        }
    }

    /// Mutably borrow the derived-node state, if any.
    pub fn as_derived_mut(&mut self) -> Option<&mut Derived> {
        match &mut self.kind {
            NodeKind::Derived(derived) => Some(derived),
            NodeKind::Signal => None,
        }
    }

    /// Height of a derived node; signals have none.
    pub fn height(&self) -> Option<usize> {
        self.as_derived().map(|derived| derived.height)
    }

    /// Scheduling flags; signals are always clean.
    pub fn flags(&self) -> NodeFlags {
        self.as_derived()
            .map_or(NodeFlags::empty(), |derived| derived.flags)
    }

    /// Whether any node reads this one.
    pub fn is_watched(&self) -> bool {
        self.subs.is_some()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("derived", &self.is_derived())
            .field("height", &self.height())
            .field("flags", &self.flags())
            .field("state", &self.state)
            .field("watched", &self.is_watched())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
