//! Dependency Graph
//!
//! This module implements the computational dependency graph that tracks
//! relationships between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are signals (written from outside) or derived nodes (computed)
//! - Links are edges: if A reads B, there is a link from B (producer) to A
//!   (consumer)
//!
//! When a signal changes, its subscribers are queued by height and the
//! evaluator recomputes them in ascending height order, which settles every
//! producer before any of its consumers.
//!
//! # Design Decisions
//!
//! 1. Nodes and links live in generational arenas and refer to each other by
//!    handle, so intrusive lists can be rewired without aliasing pointers.
//!
//! 2. Every link is threaded through two lists at once: the consumer's
//!    dependency list (read order) and the producer's subscriber list.
//!    Re-linking after a recompute reuses links in place.
//!
//! 3. The scheduler is a bucket-per-height ring structure instead of a
//!    sorted queue. Heights are maintained incrementally during evaluation.

pub(crate) mod arena;
mod link;
mod node;
mod scheduler;
mod store;

pub use link::LinkId;
pub use node::NodeId;
pub(crate) use node::{
    value_eq, AsyncStatus, Cleanup, ComputeFn, EqFn, ErrorRecord, NodeFlags, Outcome, Snapshot,
    Value,
};
pub(crate) use store::Graph;
