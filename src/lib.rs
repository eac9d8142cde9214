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

//! Generic lease-based connection pooling
//!
//! The pool multiplexes a bounded set of expensive, long-lived connections across many
//! asynchronous waiters. A connection serves up to its declared *concurrency* of simultaneous
//! [leases](Lease), and concurrency may change over the connection's lifetime. Waiters are
//! served fifo; matching is delegated to a replaceable [selector](Selector); new connections
//! are opened through a caller-supplied [Connector] under per-kind capacity budgets.
//!
//! Every completion is dispatched to the [Context] its submitter provided. Closing the pool
//! drains the waiter queue and accounts for every connection, including connects still in
//! flight.

#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

mod combiner;
pub mod context;
pub mod error;

mod connector;
mod lease;
mod pool;
mod selector;
mod waiter;

pub use connector::{ConnectResult, Connector, SlotListener};
pub use context::{Context, EventLoop, Task};
pub use error::{BError, Error, ErrorType, Result};
pub use lease::Lease;
pub use pool::{ContextProvider, Pool};
pub use selector::{Candidate, PendingAcquire, Selector};
pub use waiter::{Waiter, WaiterListener};
