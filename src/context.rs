// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cooperative execution contexts
//!
//! Every pool callback is dispatched to the [Context] its submitter provided, so callers never
//! observe pool internals from a foreign thread. [EventLoop] is the provided implementation: a
//! single driver task that runs closures in arrival order and drives spawned futures alongside
//! them.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A deferred closure dispatched to a [Context]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative execution context.
///
/// Closures sent to the same context via [dispatch](Context::dispatch) run one at a time, in
/// arrival order. Contexts are compared by identity: two handles are the same context iff their
/// [root](Context::root)s are the same allocation.
pub trait Context: Send + Sync + 'static {
    /// Schedule the task to run on this context.
    fn dispatch(&self, task: Task);

    /// Drive the future to completion on this context, concurrently with dispatched tasks.
    fn spawn(&self, fut: BoxFuture<'static, ()>);

    /// Identity of the underlying event loop driving this context.
    ///
    /// Distinct contexts may share one event loop, see [EventLoop::sibling].
    fn event_loop_id(&self) -> u64;

    /// The context this one was duplicated from, `None` when self is a root.
    fn root(&self) -> Option<Arc<dyn Context>> {
        None
    }
}

/// Resolve the root of a possibly duplicated context.
pub fn root_of(ctx: &Arc<dyn Context>) -> Arc<dyn Context> {
    let mut current = ctx.clone();
    while let Some(parent) = current.root() {
        current = parent;
    }
    current
}

/// Whether two handles refer to the same root context.
pub fn same_context(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    // thin-compare the data pointers, the vtables don't matter for identity
    std::ptr::eq(
        Arc::as_ptr(&root_of(a)) as *const u8,
        Arc::as_ptr(&root_of(b)) as *const u8,
    )
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<u64> = Cell::new(0);
}

enum Work {
    Task(Task),
    Fut(BoxFuture<'static, ()>),
}

/// A minimal event loop backed by a tokio task.
///
/// Closures dispatched to it run strictly in arrival order; spawned futures are driven on the
/// same driver, interleaved with the closures. Dropping every handle of a loop shuts the driver
/// down once its remaining work is done.
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Work>,
    id: u64,
    root: Option<Arc<dyn Context>>,
}

impl EventLoop {
    /// Create a context with its own driver task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Arc<EventLoop> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(Self::drive(id, rx));
        Arc::new(EventLoop { tx, id, root: None })
    }

    /// Create a distinct root context sharing this context's driver.
    pub fn sibling(self: &Arc<Self>) -> Arc<EventLoop> {
        Arc::new(EventLoop {
            tx: self.tx.clone(),
            id: self.id,
            root: None,
        })
    }

    /// Duplicate this context. The duplicate dispatches to the same driver and unwraps to this
    /// context's root.
    pub fn duplicate(self: &Arc<Self>) -> Arc<EventLoop> {
        let this: Arc<dyn Context> = self.clone();
        Arc::new(EventLoop {
            tx: self.tx.clone(),
            id: self.id,
            root: Some(root_of(&this)),
        })
    }

    /// The loop id of the [EventLoop] currently running a dispatched task on this thread, if any.
    pub fn current_id() -> Option<u64> {
        let id = CURRENT_LOOP.with(|c| c.get());
        if id == 0 {
            None
        } else {
            Some(id)
        }
    }

    async fn drive(id: u64, mut rx: mpsc::UnboundedReceiver<Work>) {
        let mut futs = FuturesUnordered::new();
        loop {
            tokio::select! {
                work = rx.recv() => match work {
                    Some(Work::Task(task)) => {
                        CURRENT_LOOP.with(|c| c.set(id));
                        task();
                        CURRENT_LOOP.with(|c| c.set(0));
                    }
                    Some(Work::Fut(fut)) => futs.push(fut),
                    None => break,
                },
                Some(()) = futs.next(), if !futs.is_empty() => {}
            }
        }
        // all handles dropped, finish the in-flight futures
        while futs.next().await.is_some() {}
    }
}

impl Context for EventLoop {
    fn dispatch(&self, task: Task) {
        // send only fails when the driver is gone, which means no one can observe the task
        let _ = self.tx.send(Work::Task(task));
    }

    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        let _ = self.tx.send(Work::Fut(fut));
    }

    fn event_loop_id(&self) -> u64 {
        self.id
    }

    fn root(&self) -> Option<Arc<dyn Context>> {
        self.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_dispatch_order() {
        let ctx = EventLoop::new();
        let seq = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        for i in 0..10 {
            let seq = seq.clone();
            ctx.dispatch(Box::new(move || {
                assert_eq!(i, seq.fetch_add(1, Ordering::SeqCst));
            }));
        }
        ctx.dispatch(Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.await.unwrap();
        assert_eq!(10, seq.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_current_id() {
        let ctx = EventLoop::new();
        let id = ctx.event_loop_id();
        let (tx, rx) = oneshot::channel();
        ctx.dispatch(Box::new(move || {
            tx.send(EventLoop::current_id()).unwrap();
        }));
        assert_eq!(Some(id), rx.await.unwrap());
        assert_eq!(None, EventLoop::current_id());
    }

    #[tokio::test]
    async fn test_duplicate_unwraps_to_root() {
        let ctx = EventLoop::new();
        let dup = ctx.duplicate();
        let dup2 = dup.duplicate();
        let root: Arc<dyn Context> = ctx.clone();
        let leaf: Arc<dyn Context> = dup2;
        assert!(same_context(&root, &leaf));
        assert_eq!(root.event_loop_id(), leaf.event_loop_id());
    }

    #[tokio::test]
    async fn test_sibling_is_distinct() {
        let ctx = EventLoop::new();
        let sib = ctx.sibling();
        let a: Arc<dyn Context> = ctx.clone();
        let b: Arc<dyn Context> = sib;
        assert!(!same_context(&a, &b));
        assert_eq!(a.event_loop_id(), b.event_loop_id());
    }

    #[tokio::test]
    async fn test_spawned_future_runs() {
        let ctx = EventLoop::new();
        let (tx, rx) = oneshot::channel();
        ctx.spawn(Box::pin(async move {
            tx.send(()).unwrap();
        }));
        rx.await.unwrap();
    }
}
