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

//! Pending acquires

use crate::context::Context;
use crate::error::Result;
use crate::lease::Lease;
use crate::pool::SlotKey;
use std::sync::Arc;

/// Handle to a pending acquire, usable with [cancel](crate::Pool::cancel).
///
/// The handle stays valid after the acquire completed; cancelling it then reports `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub(crate) id: u64,
}

/// Hooks observing the lifecycle of one acquire.
///
/// Invoked inside the pool's serialization domain: implementations must be quick and must not
/// call back into the pool synchronously.
pub trait WaiterListener: Send {
    /// The waiter was appended to the queue.
    fn on_enqueue(&self, _waiter: &Waiter) {}

    /// A connect was initiated on behalf of this waiter.
    fn on_connect(&self, _waiter: &Waiter) {}
}

pub(crate) type AcquireSink<C> = Box<dyn FnOnce(Result<Lease<C>>) + Send>;

/// One pending acquire. The record lives until the sink fires or the waiter is cancelled;
/// `assigned` is set while a connect initiated for this waiter is in flight.
pub(crate) struct WaiterRecord<C: Clone + Send + 'static> {
    pub kind: usize,
    pub context: Arc<dyn Context>,
    pub listener: Option<Box<dyn WaiterListener>>,
    pub sink: AcquireSink<C>,
    pub assigned: Option<SlotKey>,
}
