//! Asynchronous Memos
//!
//! An async memo runs a synchronous part inside its evaluation (its reads
//! are tracked like any memo's) that returns a future or a stream. The
//! evaluation itself yields "not ready"; the future or stream is handed to
//! the runtime's [`Spawn`]er and each value it produces is published to the
//! graph when it arrives, followed by a drain.
//!
//! # Abandonment
//!
//! Every evaluation registers a cleanup that flips an `abandoned` flag for
//! its flight. Re-evaluating the memo, or tearing it down, runs the cleanup,
//! and anything the old flight produces afterwards is discarded.
//!
//! # Transactions
//!
//! A flight started while a transaction is bound delivers its results back
//! into that transaction. Abandoning it from outside the transaction drops
//! the node from the transaction, which can then commit without it.

use std::cell::Cell;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::stream::{self, LocalBoxStream, Stream, StreamExt};
use tracing::{trace, warn};

use super::memo::Memo;
use super::runtime::{Runtime, RuntimeInner};
use super::transaction::Transaction;
use crate::error::Result;
use crate::graph::{value_eq, ComputeFn, NodeId, Outcome, Value};

/// Executes the background work of async memos.
///
/// Tasks are `!Send`: they capture runtime handles and must run on the
/// runtime's own thread. A spawner may poll a task before `spawn_local`
/// returns; whatever it resolves in the middle of an evaluation is held
/// back until the runtime is idle again.
pub trait Spawn {
    /// Start `task`; it must eventually be polled to completion on this
    /// thread.
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>);
}

/// Spawns onto the current tokio [`LocalSet`](tokio::task::LocalSet).
///
/// # Panics
///
/// Spawning panics when called outside a `LocalSet` context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawn for TokioSpawner {
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(task);
    }
}

impl<F> Spawn for F
where
    F: Fn(LocalBoxFuture<'static, ()>),
{
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>) {
        self(task)
    }
}

impl Runtime {
    /// Create a memo whose value is produced by a future.
    ///
    /// `f` receives the previous value and returns the future to await, or
    /// fails right away. While the future is in flight, reads fail with
    /// [`Error::NotReady`](crate::Error::NotReady) (or see the previous value
    /// inside [`latest`](Runtime::latest)).
    pub fn async_memo<T, F, Fut>(&self, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<Fut> + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        self.spawn_memo(None, move |prev| {
            f(prev).map(|fut| stream::once(fut).boxed_local())
        })
    }

    /// Like [`async_memo`](Self::async_memo), starting from `initial`.
    pub fn async_memo_with<T, F, Fut>(&self, initial: T, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<Fut> + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        self.spawn_memo(Some(initial), move |prev| {
            f(prev).map(|fut| stream::once(fut).boxed_local())
        })
    }

    /// Create a memo fed by a stream: every item becomes the memo's new
    /// value (or error) until the memo re-evaluates.
    pub fn stream_memo<T, F, S>(&self, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<S> + 'static,
        S: Stream<Item = Result<T>> + 'static,
    {
        self.spawn_memo(None, move |prev| f(prev).map(StreamExt::boxed_local))
    }

    /// Like [`stream_memo`](Self::stream_memo), starting from `initial`.
    pub fn stream_memo_with<T, F, S>(&self, initial: T, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<S> + 'static,
        S: Stream<Item = Result<T>> + 'static,
    {
        self.spawn_memo(Some(initial), move |prev| {
            f(prev).map(StreamExt::boxed_local)
        })
    }

    fn spawn_memo<T, F>(&self, initial: Option<T>, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> Result<LocalBoxStream<'static, Result<T>>> + 'static,
    {
        let compute: ComputeFn = Rc::new(move |rt: &Runtime, id: NodeId, prev: Option<&Value>| {
            let prev = prev.and_then(|value| value.downcast_ref::<T>());
            match f(prev) {
                Ok(updates) => {
                    let updates = updates
                        .map(|update| update.map(|value| Rc::new(value) as Value))
                        .boxed_local();
                    rt.launch(id, updates);
                    Outcome::Pending
                }
                Err(err) => Outcome::from(Err(err)),
            }
        });
        let initial = initial.map(|value| Rc::new(value) as Value);
        let id = self.create_derived(compute, initial, value_eq::<T>);
        Memo::from_id(self, id)
    }

    /// Start a flight for derived node `id`.
    fn launch(&self, id: NodeId, mut updates: LocalBoxStream<'static, Result<Value>>) {
        let abandoned = Rc::new(Cell::new(false));
        let transaction = self.current_transaction();
        let runtime: Weak<RuntimeInner> = Rc::downgrade(&self.inner);
        self.add_cleanup(id, {
            let (flag, transaction, runtime) =
                (abandoned.clone(), transaction.clone(), runtime.clone());
            Box::new(move || {
                flag.set(true);
                if let Some(tx) = transaction {
                    release_flight(&runtime, &tx, id);
                }
            })
        });

        let task = async move {
            while let Some(update) = updates.next().await {
                if abandoned.get() {
                    trace!(node = ?id, "discarding abandoned resolution");
                    return;
                }
                let Some(inner) = runtime.upgrade() else {
                    return;
                };
                Runtime { inner }.deliver(Resolution {
                    id,
                    update,
                    transaction: transaction.clone(),
                    abandoned: abandoned.clone(),
                });
            }
        };
        self.inner.spawner.spawn_local(task.boxed_local());
    }

    /// Publish a resolution now, or queue it until the runtime is idle when
    /// it arrives in the middle of an evaluation or a drain.
    fn deliver(&self, resolution: Resolution) {
        let busy =
            self.inner.frontier.get().is_some() || self.inner.context.get().owner.is_some();
        if busy {
            trace!(node = ?resolution.id, "deferring resolution");
            self.inner.resolutions.borrow_mut().push_back(resolution);
        } else {
            self.resolve(resolution);
        }
    }

    /// Publish one result of a flight, then drain.
    pub(crate) fn resolve(&self, resolution: Resolution) {
        let Resolution {
            id,
            update,
            transaction,
            abandoned,
        } = resolution;
        if abandoned.get() {
            trace!(node = ?id, "discarding abandoned resolution");
            return;
        }
        let apply = || {
            self.inner.marked.set(false);
            let replaced = {
                let mut graph = self.inner.graph.borrow_mut();
                if graph.get(id).is_none() {
                    warn!(node = ?id, "resolution for a freed node");
                    return;
                }
                trace!(node = ?id, ok = update.is_ok(), "resolution");
                self.apply(&mut graph, id, Outcome::from(update), false)
            };
            drop(replaced);
            self.stabilize();
        };
        match &transaction {
            Some(tx) => tx.run(apply),
            None => apply(),
        }
    }
}

/// A value or error produced by a flight, on its way into the graph.
pub(crate) struct Resolution {
    id: NodeId,
    update: Result<Value>,
    transaction: Option<Transaction>,
    abandoned: Rc<Cell<bool>>,
}

/// A flight started under `tx` was abandoned. Its node no longer holds the
/// transaction back, and unless `tx` itself is re-evaluating the node, the
/// speculative state the flight would have replaced is dropped too.
fn release_flight(runtime: &Weak<RuntimeInner>, tx: &Transaction, id: NodeId) {
    tx.set_pending(id, false);
    let reevaluating = runtime
        .upgrade()
        .and_then(|inner| Runtime { inner }.current_transaction())
        .is_some_and(|bound| bound.ptr_eq(tx));
    if !reevaluating {
        trace!(node = ?id, "flight abandoned outside its transaction");
        drop(tx.discard(id));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::Error;

    /// Spawner that parks tasks until the test polls them.
    #[derive(Clone, Default)]
    struct Parked(Rc<RefCell<Vec<LocalBoxFuture<'static, ()>>>>);

    impl Spawn for Parked {
        fn spawn_local(&self, task: LocalBoxFuture<'static, ()>) {
            self.0.borrow_mut().push(task);
        }
    }

    impl Parked {
        fn run_all(&self) {
            let tasks: Vec<_> = self.0.borrow_mut().drain(..).collect();
            for task in tasks {
                futures_util::FutureExt::now_or_never(task);
            }
        }
    }

    #[test]
    fn ready_future_resolves_when_polled() {
        let parked = Parked::default();
        let rt = Runtime::with_spawner(RuntimeConfig::default(), parked.clone());
        let s = rt.signal(1);
        let a = {
            let s = s.clone();
            rt.async_memo(move |_| {
                let v = s.get();
                Ok(async move { Ok::<_, Error>(v + 1) })
            })
        };

        assert!(a.get().unwrap_err().is_not_ready());
        assert!(a.is_pending());
        parked.run_all();
        assert_eq!(a.get().unwrap(), 2);
    }

    #[test]
    fn abandoned_flight_is_discarded() {
        let parked = Parked::default();
        let rt = Runtime::with_spawner(RuntimeConfig::default(), parked.clone());
        let s = rt.signal(1);
        let a = {
            let s = s.clone();
            rt.async_memo(move |_| {
                let v = s.get();
                Ok(async move { Ok::<_, Error>(v * 10) })
            })
        };

        s.set(2);
        rt.stabilize();
        assert_eq!(parked.0.borrow().len(), 2);
        parked.run_all();
        assert_eq!(a.get().unwrap(), 20);
    }

    #[test]
    fn synchronous_failure_skips_the_flight() {
        let parked = Parked::default();
        let rt = Runtime::with_spawner(RuntimeConfig::default(), parked.clone());
        let a = rt.async_memo(|_: Option<&i32>| {
            Err::<std::future::Ready<Result<i32>>, _>(Error::msg("no connection"))
        });

        assert!(parked.0.borrow().is_empty());
        assert!(matches!(a.get(), Err(Error::Failed(_))));
    }

    #[test]
    fn inline_spawner_resolves_once_idle() {
        let rt = Runtime::with_spawner(
            RuntimeConfig::default(),
            |task: LocalBoxFuture<'static, ()>| {
                let _ = task.now_or_never();
            },
        );
        let s = rt.signal(1);
        let a = {
            let s = s.clone();
            rt.async_memo(move |_| {
                let v = s.get();
                Ok(async move { Ok::<_, Error>(v * 3) })
            })
        };
        assert_eq!(a.get().unwrap(), 3);

        s.set(2);
        rt.stabilize();
        assert_eq!(a.get().unwrap(), 6);
        assert!(rt.inner.resolutions.borrow().is_empty());
    }

    #[test]
    fn closures_can_spawn() {
        let queue: Rc<RefCell<Vec<LocalBoxFuture<'static, ()>>>> = Rc::default();
        let sink = queue.clone();
        let rt = Runtime::with_spawner(
            RuntimeConfig::default(),
            move |task: LocalBoxFuture<'static, ()>| sink.borrow_mut().push(task),
        );
        let a = rt.async_memo(|_: Option<&u8>| Ok(async { Ok::<_, Error>(9) }));
        assert_eq!(queue.borrow().len(), 1);

        let tasks: Vec<_> = queue.borrow_mut().drain(..).collect();
        for task in tasks {
            task.now_or_never();
        }
        assert_eq!(a.get().unwrap(), 9);
    }
}
