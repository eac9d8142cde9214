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

//! Matching waiters to eligible connections

use crate::context::{root_of, same_context, Context};
use std::sync::Arc;

/// The head waiter a [Selector] is matching.
pub struct PendingAcquire {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) kind: usize,
}

impl PendingAcquire {
    /// The submitter context of the acquire.
    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    /// The requested kind.
    pub fn kind(&self) -> usize {
        self.kind
    }
}

/// One eligible connection in a match snapshot.
pub struct Candidate<C> {
    pub(crate) index: usize,
    pub(crate) connection: C,
    pub(crate) context: Arc<dyn Context>,
    pub(crate) concurrency: u32,
    pub(crate) used: u32,
}

impl<C> Candidate<C> {
    pub fn get(&self) -> &C {
        &self.connection
    }

    /// The context the connection was established on.
    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Leases left before this connection is saturated.
    pub fn available(&self) -> u32 {
        self.concurrency - self.used
    }
}

/// Picks a candidate (by index into the snapshot) for the head waiter, or `None` to leave it
/// queued.
///
/// Must be pure over its inputs: the snapshot is taken inside the pool's critical section, so a
/// selector must not call back into the pool. Replacing the selector affects subsequent match
/// iterations only.
pub type Selector<C> =
    Arc<dyn Fn(&PendingAcquire, &[Candidate<C>]) -> Option<usize> + Send + Sync>;

/// The default tie-break: a connection on the waiter's own (root) context, else one on the same
/// event loop, else the first candidate.
pub(crate) fn default_selector<C: 'static>() -> Selector<C> {
    Arc::new(|waiter, candidates| {
        let waiter_root = root_of(waiter.context());
        let mut same_loop = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if same_context(candidate.context(), waiter.context()) {
                return Some(i);
            }
            if same_loop.is_none()
                && root_of(candidate.context()).event_loop_id() == waiter_root.event_loop_id()
            {
                same_loop = Some(i);
            }
        }
        same_loop.or(if candidates.is_empty() { None } else { Some(0) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventLoop;

    fn candidate(index: usize, ctx: &Arc<EventLoop>) -> Candidate<u32> {
        Candidate {
            index,
            connection: index as u32,
            context: ctx.clone() as Arc<dyn Context>,
            concurrency: 1,
            used: 0,
        }
    }

    #[tokio::test]
    async fn test_prefers_same_context() {
        let a = EventLoop::new();
        let b = EventLoop::new();
        let selector = default_selector::<u32>();
        let waiter = PendingAcquire {
            context: b.clone() as Arc<dyn Context>,
            kind: 0,
        };
        let snapshot = vec![candidate(0, &a), candidate(1, &b)];
        assert_eq!(Some(1), selector(&waiter, &snapshot));
    }

    #[tokio::test]
    async fn test_prefers_same_event_loop() {
        let a = EventLoop::new();
        let b = EventLoop::new();
        let selector = default_selector::<u32>();
        // same driver as b but a distinct context
        let waiter = PendingAcquire {
            context: b.sibling() as Arc<dyn Context>,
            kind: 0,
        };
        let snapshot = vec![candidate(0, &a), candidate(1, &b)];
        assert_eq!(Some(1), selector(&waiter, &snapshot));
    }

    #[tokio::test]
    async fn test_falls_back_to_first() {
        let a = EventLoop::new();
        let b = EventLoop::new();
        let c = EventLoop::new();
        let selector = default_selector::<u32>();
        let waiter = PendingAcquire {
            context: c as Arc<dyn Context>,
            kind: 0,
        };
        let snapshot = vec![candidate(0, &a), candidate(1, &b)];
        assert_eq!(Some(0), selector(&waiter, &snapshot));
        assert_eq!(None, selector(&waiter, &[]));
    }

    #[tokio::test]
    async fn test_unwraps_duplicated_context() {
        let a = EventLoop::new();
        let b = EventLoop::new();
        let selector = default_selector::<u32>();
        let waiter = PendingAcquire {
            context: b.duplicate() as Arc<dyn Context>,
            kind: 0,
        };
        let snapshot = vec![candidate(0, &a), candidate(1, &b)];
        assert_eq!(Some(1), selector(&waiter, &snapshot));
    }
}
