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

//! The serialization domain of the pool
//!
//! All state mutations are funneled through a lock-free injection queue drained by one thread at
//! a time (the combiner). Each action runs against the guarded state and collects post-actions,
//! which the combiner runs after releasing the state, so user callbacks never execute inside the
//! critical section and re-entrant calls from callbacks land behind the current drain cursor
//! instead of growing the stack.

use crate::context::{Context, Task};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type Action<S> = Box<dyn FnOnce(&mut S, &mut PostActions) + Send>;

struct PostAction {
    /// dispatch target; `None` runs on the draining thread
    target: Option<Arc<dyn Context>>,
    task: Task,
}

/// Callbacks collected by an action, drained in arrival order once the state is released.
pub(crate) struct PostActions {
    items: VecDeque<PostAction>,
}

impl PostActions {
    fn new() -> Self {
        PostActions {
            items: VecDeque::new(),
        }
    }

    /// Queue a task to be dispatched to the given context.
    pub fn dispatch(&mut self, target: &Arc<dyn Context>, task: Task) {
        self.items.push_back(PostAction {
            target: Some(target.clone()),
            task,
        });
    }

    /// Queue a task to run on the draining thread, outside the critical section.
    pub fn run(&mut self, task: Task) {
        self.items.push_back(PostAction { target: None, task });
    }

    fn drain(&mut self) {
        while let Some(post) = self.items.pop_front() {
            match post.target {
                Some(ctx) => ctx.dispatch(post.task),
                None => (post.task)(),
            }
        }
    }
}

/// Serializes actions over `S` and trampolines their post-actions.
pub(crate) struct Combiner<S> {
    state: Mutex<S>,
    injected: SegQueue<Action<S>>,
    combining: AtomicBool,
}

impl<S> Combiner<S> {
    pub fn new(state: S) -> Self {
        Combiner {
            state: Mutex::new(state),
            injected: SegQueue::new(),
            combining: AtomicBool::new(false),
        }
    }

    /// Submit an action. The calling thread becomes the combiner when none is active, draining
    /// its own action plus everything injected while it drains; otherwise the action is left for
    /// the active combiner and this call returns immediately.
    pub fn submit(&self, action: Action<S>) {
        self.injected.push(action);
        while self
            .combining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            while let Some(action) = self.injected.pop() {
                let mut post = PostActions::new();
                {
                    let mut state = self.state.lock();
                    action(&mut state, &mut post);
                }
                // post tasks may re-enter submit(); the flag is still held so they only inject
                post.drain();
            }
            self.combining.store(false, Ordering::Release);
            if self.injected.is_empty() {
                break;
            }
        }
    }
}
