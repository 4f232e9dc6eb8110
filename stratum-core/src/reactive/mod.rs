//! Reactive Primitives
//!
//! This module implements the engine on top of the [`graph`](crate::graph):
//! signals, memos, async memos, and transactions, all owned by a
//! [`Runtime`].
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal is read while a
//! memo evaluates, the memo is recorded as a dependent. When the signal's
//! value changes, its dependents are queued for recomputation.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changed, and its own dependents are left
//! alone when the new result equals the old one.
//!
//! ## Async memos
//!
//! An async memo hands a future or stream to a spawner. Until a value
//! arrives, readers get [`Error::NotReady`](crate::Error::NotReady), which
//! propagates through `?` like any error.
//!
//! ## Transactions
//!
//! A Transaction gathers writes in an isolated overlay that other code does
//! not see until it commits.
//!
//! # Implementation Notes
//!
//! Dependencies are detected automatically: the runtime keeps track of the
//! memo being evaluated, and every read links the node it reads to that
//! memo. Dependency lists are rebuilt in place on every evaluation, so
//! branches that stop reading a node also stop depending on it.

mod async_memo;
mod context;
mod evaluate;
mod memo;
mod runtime;
mod signal;
mod transaction;

pub use async_memo::{Spawn, TokioSpawner};
pub use memo::{Memo, MemoState};
pub use runtime::Runtime;
pub use signal::Signal;
pub use transaction::Transaction;
