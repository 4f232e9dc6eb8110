//! Stratum Core
//!
//! This crate provides a fine-grained incremental computation engine: a
//! dataflow graph of memoized values that recompute automatically, and only
//! when necessary, as their inputs change.
//!
//! It implements:
//!
//! - Reactive primitives (signals, memos) with automatic dependency tracking
//! - Height-stratified, glitch-free recomputation with equality cutoff
//! - Asynchronous memos backed by futures and streams
//! - Isolated transactions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: nodes, intrusive dependency links, and the height scheduler
//! - `reactive`: the runtime, typed handles, async memos, and transactions
//! - `error`: the error type readers see
//! - `config`: runtime configuration
//!
//! # Example
//!
//! ```rust
//! use stratum_core::Runtime;
//!
//! let rt = Runtime::new();
//!
//! // Create a signal
//! let count = rt.signal(0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     rt.memo(move |_| Ok(count.get() * 2))
//! };
//!
//! // Update the signal and let the graph settle
//! count.set(5);
//! rt.stabilize();
//! assert_eq!(doubled.get().unwrap(), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{Error, Failure, Result};
pub use graph::NodeId;
pub use reactive::{Memo, MemoState, Runtime, Signal, Spawn, TokioSpawner, Transaction};
