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

//! Connecting on behalf of the pool

use crate::context::Context;
use crate::error::Result;
use crate::pool::{PoolInner, SlotKey};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// What a successful connect reports back to the pool.
pub struct ConnectResult<C> {
    pub(crate) connection: C,
    pub(crate) concurrency: u32,
    pub(crate) weight: u32,
}

impl<C> ConnectResult<C> {
    /// A connection with the given concurrency and the default capacity weight of 1.
    pub fn new(connection: C, concurrency: u32) -> Self {
        ConnectResult {
            connection,
            concurrency,
            weight: 1,
        }
    }

    /// Override the capacity weight this connection costs within its kind.
    ///
    /// Weights below 1 are normalized to 1, eviction accounting needs them positive.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Initiates outbound connections for the pool.
///
/// `connect` is called on the context derived from the acquiring waiter; the returned connection
/// is multiplexed across up to `concurrency` leases at a time. The connector reports later
/// lifecycle changes of the connection through the [SlotListener] it was handed.
#[async_trait]
pub trait Connector<C: Clone + Send + 'static>: Send + Sync {
    /// Establish one connection. The declared concurrency may be 0 to admit the connection in a
    /// temporarily unusable state, a later concurrency change makes it usable.
    async fn connect(
        &self,
        ctx: &Arc<dyn Context>,
        listener: SlotListener<C>,
    ) -> Result<ConnectResult<C>>;

    /// Advisory validity check, consulted by selectors and eviction predicates, not by the pool
    /// itself.
    fn is_valid(&self, _connection: &C) -> bool {
        true
    }
}

/// Events a connector reports about one connection, posted into the pool's serialization domain.
pub(crate) enum SlotEvent<C> {
    Removed,
    ConcurrencyChanged(u32),
    ConnectCompleted(Result<ConnectResult<C>>),
}

/// The per-connection listener handed to [Connector::connect].
///
/// Cheap to clone and safe to signal from any thread, before or after the connect resolves.
/// Signals arriving after the connection left the pool are dropped.
pub struct SlotListener<C: Clone + Send + 'static> {
    pub(crate) pool: Weak<PoolInner<C>>,
    pub(crate) slot: SlotKey,
}

impl<C: Clone + Send + 'static> Clone for SlotListener<C> {
    fn clone(&self) -> Self {
        SlotListener {
            pool: self.pool.clone(),
            slot: self.slot,
        }
    }
}

impl<C: Clone + Send + 'static> SlotListener<C> {
    /// The connection became unusable. Existing leases stay valid, no new leases are issued.
    pub fn on_remove(&self) {
        if let Some(pool) = self.pool.upgrade() {
            PoolInner::deliver(&pool, self.slot, SlotEvent::Removed);
        }
    }

    /// The connection's concurrency changed. An increase may unblock queued waiters, a decrease
    /// never revokes outstanding leases.
    pub fn on_concurrency_change(&self, concurrency: u32) {
        if let Some(pool) = self.pool.upgrade() {
            PoolInner::deliver(&pool, self.slot, SlotEvent::ConcurrencyChanged(concurrency));
        }
    }
}
