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

//! One-shot lease handles

use crate::error::{Error, ErrorType, Result};
use crate::pool::{PoolInner, SlotKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One unit of concurrency on a pooled connection.
///
/// Holds a shared view of the connection; the view must not be retained past
/// [recycle](Lease::recycle). A lease dropped without an explicit recycle is recycled by `Drop`.
pub struct Lease<C: Clone + Send + 'static> {
    pool: Arc<PoolInner<C>>,
    slot: SlotKey,
    connection: C,
    recycled: AtomicBool,
}

impl<C: Clone + Send + 'static> Lease<C> {
    pub(crate) fn new(pool: Arc<PoolInner<C>>, slot: SlotKey, connection: C) -> Self {
        Lease {
            pool,
            slot,
            connection,
            recycled: AtomicBool::new(false),
        }
    }

    /// The leased connection.
    pub fn get(&self) -> &C {
        &self.connection
    }

    /// Return this lease's share of the connection to the pool.
    ///
    /// Valid after the connection was removed or the pool closed (the share is still accounted
    /// for). Recycling twice fails with [AlreadyRecycled](ErrorType::AlreadyRecycled) and leaves
    /// the pool unaffected.
    pub fn recycle(&self) -> Result<()> {
        if self.recycled.swap(true, Ordering::AcqRel) {
            return Error::e_explain(ErrorType::AlreadyRecycled, "lease recycled twice");
        }
        PoolInner::recycle(&self.pool, self.slot);
        Ok(())
    }
}

impl<C: Clone + Send + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if !self.recycled.swap(true, Ordering::AcqRel) {
            PoolInner::recycle(&self.pool, self.slot);
        }
    }
}

impl<C: Clone + Send + std::fmt::Debug + 'static> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection)
            .field("recycled", &self.recycled.load(Ordering::Relaxed))
            .finish()
    }
}
