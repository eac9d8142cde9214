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

//! The pool core
//!
//! Owns the slot arena and the waiter queue, serializes every transition through the combiner
//! and re-runs the match loop on each state change. Callbacks are delivered to the submitter's
//! context, never from inside the critical section.

use crate::combiner::{Combiner, PostActions};
use crate::connector::{ConnectResult, Connector, SlotEvent, SlotListener};
use crate::context::{root_of, Context};
use crate::error::{Error, ErrorType, Result};
use crate::lease::Lease;
use crate::selector::{default_selector, Candidate, PendingAcquire, Selector};
use crate::waiter::{AcquireSink, Waiter, WaiterListener, WaiterRecord};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Maps a submitter context to the context a new connection is established on.
///
/// The default unwraps duplicated contexts to their root.
pub type ContextProvider = Arc<dyn Fn(&Arc<dyn Context>) -> Arc<dyn Context> + Send + Sync>;

/// Identity of one slot: arena index plus a generation detecting reuse after discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotKey {
    index: usize,
    gen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Connecting,
    Available,
    Removed,
}

/// Per-connection record. Created Connecting, Available on connect success, Removed on removal;
/// a Removed slot lingers until its outstanding leases are recycled.
struct Slot<C> {
    kind: usize,
    weight: u32,
    concurrency: u32,
    used: u32,
    state: SlotState,
    context: Arc<dyn Context>,
    connection: Option<C>,
    bound_waiter: Option<u64>,
}

struct ArenaEntry<T> {
    gen: u64,
    value: Option<T>,
}

/// Index arena with generation-validated keys. Entries keep their index for the lifetime of an
/// occupancy, so snapshot and eviction orders are deterministic.
struct Arena<T> {
    entries: Vec<ArenaEntry<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Arena {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, value: T) -> SlotKey {
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.value = Some(value);
                SlotKey {
                    index,
                    gen: entry.gen,
                }
            }
            None => {
                self.entries.push(ArenaEntry {
                    gen: 1,
                    value: Some(value),
                });
                SlotKey {
                    index: self.entries.len() - 1,
                    gen: 1,
                }
            }
        }
    }

    fn key_at(&self, index: usize) -> SlotKey {
        SlotKey {
            index,
            gen: self.entries[index].gen,
        }
    }

    fn get(&self, key: SlotKey) -> Option<&T> {
        let entry = self.entries.get(key.index)?;
        if entry.gen != key.gen {
            return None;
        }
        entry.value.as_ref()
    }

    fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        let entry = self.entries.get_mut(key.index)?;
        if entry.gen != key.gen {
            return None;
        }
        entry.value.as_mut()
    }

    fn remove(&mut self, key: SlotKey) -> Option<T> {
        let entry = self.entries.get_mut(key.index)?;
        if entry.gen != key.gen {
            return None;
        }
        let value = entry.value.take()?;
        entry.gen += 1;
        self.free.push(key.index);
        Some(value)
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.value.as_ref().map(|v| (index, v)))
    }
}

/// Close in progress: connects still in flight keep the sink pending until each contributed its
/// outcome entry.
struct Closing<C> {
    sink: CloseSink<C>,
    results: Vec<Result<C>>,
    pending: usize,
}

type CloseSink<C> = Box<dyn FnOnce(Result<Vec<Result<C>>>) + Send>;

#[derive(Default)]
struct Counters {
    size: AtomicUsize,
    capacity: AtomicUsize,
    requests: AtomicUsize,
    waiters: AtomicUsize,
}

struct PoolState<C: Clone + Send + 'static> {
    slots: Arena<Slot<C>>,
    waiters: HashMap<u64, WaiterRecord<C>>,
    /// every pending waiter in fifo order, including those bound to an in-flight connect
    queue: VecDeque<u64>,
    kind_weights: Vec<u32>,
    size: usize,
    requests: usize,
    closed: bool,
    closing: Option<Closing<C>>,
    selector: Selector<C>,
    context_provider: ContextProvider,
}

impl<C: Clone + Send + 'static> PoolState<C> {
    fn publish(&self, counters: &Counters) {
        counters.size.store(self.size, Ordering::Relaxed);
        counters.capacity.store(
            self.kind_weights.iter().map(|&w| w as usize).sum(),
            Ordering::Relaxed,
        );
        counters.requests.store(self.requests, Ordering::Relaxed);
        counters.waiters.store(self.queue.len(), Ordering::Relaxed);
    }
}

pub(crate) struct PoolInner<C: Clone + Send + 'static> {
    combiner: Combiner<PoolState<C>>,
    connector: Arc<dyn Connector<C>>,
    max: Box<[u32]>,
    max_waiters: usize,
    counters: Counters,
    next_waiter_id: AtomicU64,
}

/// A pool of connections multiplexed across asynchronous waiters.
///
/// Cheap to clone; every clone drives the same pool.
pub struct Pool<C: Clone + Send + 'static> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Clone + Send + 'static> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Clone + Send + 'static> Pool<C> {
    /// Create a pool with one capacity budget per kind.
    ///
    /// The waiter queue limit defaults to the sum of the budgets.
    pub fn new(connector: impl Connector<C> + 'static, max_per_kind: &[u32]) -> Self {
        let max_waiters = max_per_kind.iter().map(|&m| m as usize).sum();
        Self::with_max_waiters(connector, max_per_kind, max_waiters)
    }

    /// Create a pool with an explicit waiter queue limit.
    pub fn with_max_waiters(
        connector: impl Connector<C> + 'static,
        max_per_kind: &[u32],
        max_waiters: usize,
    ) -> Self {
        assert!(!max_per_kind.is_empty(), "at least one kind is required");
        assert!(
            max_per_kind.iter().all(|&m| m > 0),
            "kind capacities must be positive"
        );
        let state = PoolState {
            slots: Arena::new(),
            waiters: HashMap::new(),
            queue: VecDeque::new(),
            kind_weights: vec![0; max_per_kind.len()],
            size: 0,
            requests: 0,
            closed: false,
            closing: None,
            selector: default_selector(),
            context_provider: Arc::new(root_of),
        };
        Pool {
            inner: Arc::new(PoolInner {
                combiner: Combiner::new(state),
                connector: Arc::new(connector),
                max: max_per_kind.into(),
                max_waiters,
                counters: Counters::default(),
                next_waiter_id: AtomicU64::new(1),
            }),
        }
    }

    /// Request a lease of the given kind.
    ///
    /// The sink runs on `context`, after a free lease was matched, a new connection was
    /// established, or the request failed (POOL_CLOSED, TOO_BUSY or CONNECT_FAILED). The
    /// returned [Waiter] can be passed to [cancel](Pool::cancel).
    pub fn acquire(
        &self,
        context: &Arc<dyn Context>,
        kind: usize,
        sink: impl FnOnce(Result<Lease<C>>) + Send + 'static,
    ) -> Waiter {
        self.acquire_inner(context, kind, None, Box::new(sink))
    }

    /// Like [acquire](Pool::acquire), with hooks observing the waiter lifecycle.
    pub fn acquire_with_listener(
        &self,
        context: &Arc<dyn Context>,
        kind: usize,
        listener: impl WaiterListener + 'static,
        sink: impl FnOnce(Result<Lease<C>>) + Send + 'static,
    ) -> Waiter {
        self.acquire_inner(context, kind, Some(Box::new(listener)), Box::new(sink))
    }

    fn acquire_inner(
        &self,
        context: &Arc<dyn Context>,
        kind: usize,
        listener: Option<Box<dyn WaiterListener>>,
        sink: AcquireSink<C>,
    ) -> Waiter {
        assert!(kind < self.inner.max.len(), "kind {} out of range", kind);
        let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter { id };
        let context = context.clone();
        self.inner.execute(move |inner, state, post| {
            if state.closed {
                post.dispatch(
                    &context,
                    Box::new(move || sink(Err(Error::new(ErrorType::PoolClosed)))),
                );
                return;
            }
            let queued = state.queue.len();
            if queued >= inner.max_waiters {
                post.dispatch(
                    &context,
                    Box::new(move || {
                        sink(Err(Error::explain(
                            ErrorType::TooBusy(queued),
                            "waiter queue is full",
                        )))
                    }),
                );
                return;
            }
            state.waiters.insert(
                id,
                WaiterRecord {
                    kind,
                    context,
                    listener,
                    sink,
                    assigned: None,
                },
            );
            state.queue.push_back(id);
            if let Some(record) = state.waiters.get(&id) {
                if let Some(listener) = &record.listener {
                    listener.on_enqueue(&waiter);
                }
            }
            PoolInner::run_matching(inner, state, post);
        });
        waiter
    }

    /// Cancel a pending acquire.
    ///
    /// The sink receives `true` iff the waiter was still pending: its acquire sink will never
    /// fire. A waiter bound to an in-flight connect is cancellable too; the connect continues
    /// and its result feeds the match loop.
    pub fn cancel(&self, waiter: &Waiter, sink: impl FnOnce(Result<bool>) + Send + 'static) {
        let id = waiter.id;
        self.inner.execute(move |_inner, state, post| {
            if state.closed {
                post.run(Box::new(move || sink(Err(Error::new(ErrorType::PoolClosed)))));
                return;
            }
            let cancelled = match PoolInner::take_waiter(state, id) {
                Some(record) => {
                    if let Some(key) = record.assigned {
                        if let Some(slot) = state.slots.get_mut(key) {
                            slot.bound_waiter = None;
                        }
                    }
                    debug!("waiter {} cancelled", id);
                    true
                }
                None => false,
            };
            post.run(Box::new(move || sink(Ok(cancelled))));
        });
    }

    /// Remove every idle available connection matching the predicate, in one atomic pass.
    ///
    /// The predicate only sees Available connections with no outstanding lease, newest slot
    /// first; connects in progress are never presented. The matched connections are returned in
    /// traversal order.
    pub fn evict(
        &self,
        predicate: impl Fn(&C) -> bool + Send + 'static,
        sink: impl FnOnce(Result<Vec<C>>) + Send + 'static,
    ) {
        self.inner.execute(move |inner, state, post| {
            if state.closed {
                post.run(Box::new(move || sink(Err(Error::new(ErrorType::PoolClosed)))));
                return;
            }
            let mut evicted = Vec::new();
            for index in (0..state.slots.len()).rev() {
                let key = state.slots.key_at(index);
                let matched = match state.slots.get(key) {
                    Some(slot) if slot.state == SlotState::Available && slot.used == 0 => slot
                        .connection
                        .as_ref()
                        .map(|conn| predicate(conn))
                        .unwrap_or(false),
                    _ => false,
                };
                if !matched {
                    continue;
                }
                if let Some(slot) = state.slots.remove(key) {
                    state.kind_weights[slot.kind] -= slot.weight;
                    state.size -= 1;
                    if let Some(conn) = slot.connection {
                        evicted.push(conn);
                    }
                }
            }
            if !evicted.is_empty() {
                debug!("evicted {} connections", evicted.len());
                PoolInner::run_matching(inner, state, post);
            }
            post.run(Box::new(move || sink(Ok(evicted))));
        });
    }

    /// Close the pool.
    ///
    /// Every pending waiter fails with POOL_CLOSED on its own context. The sink receives one
    /// outcome entry per slot that existed at close time: `Ok` for the available connections,
    /// and the eventual connect result for each connect still in flight; it fires once the last
    /// of those resolved. Any later call on the pool fails with POOL_CLOSED on a fresh
    /// dispatch.
    pub fn close(&self, sink: impl FnOnce(Result<Vec<Result<C>>>) + Send + 'static) {
        self.inner.execute(move |_inner, state, post| {
            if state.closed {
                post.run(Box::new(move || sink(Err(Error::new(ErrorType::PoolClosed)))));
                return;
            }
            state.closed = true;
            let ids: Vec<u64> = state.queue.drain(..).collect();
            for id in ids {
                if let Some(record) = state.waiters.remove(&id) {
                    let waiter_sink = record.sink;
                    post.dispatch(
                        &record.context,
                        Box::new(move || waiter_sink(Err(Error::new(ErrorType::PoolClosed)))),
                    );
                }
            }
            debug_assert!(state.waiters.is_empty());
            let mut results: Vec<Result<C>> = Vec::new();
            let mut pending = 0;
            for index in 0..state.slots.len() {
                let key = state.slots.key_at(index);
                let slot_state = match state.slots.get(key) {
                    Some(slot) => slot.state,
                    None => continue,
                };
                match slot_state {
                    SlotState::Available | SlotState::Removed => {
                        if let Some(slot) = state.slots.remove(key) {
                            if slot_state == SlotState::Available {
                                if let Some(conn) = slot.connection {
                                    results.push(Ok(conn));
                                }
                            }
                        }
                    }
                    SlotState::Connecting => {
                        if let Some(slot) = state.slots.get_mut(key) {
                            slot.state = SlotState::Removed;
                            slot.bound_waiter = None;
                        }
                        pending += 1;
                    }
                }
            }
            for weight in state.kind_weights.iter_mut() {
                *weight = 0;
            }
            state.size = 0;
            state.requests = 0;
            debug!("pool closed, {} connects still in flight", pending);
            if pending == 0 {
                post.run(Box::new(move || sink(Ok(results))));
            } else {
                state.closing = Some(Closing {
                    sink: Box::new(sink),
                    results,
                    pending,
                });
            }
        });
    }

    /// Replace the selector. Affects subsequent match iterations only.
    pub fn set_selector(&self, selector: Selector<C>) {
        self.inner.execute(move |_inner, state, _post| {
            state.selector = selector;
        });
    }

    /// Replace the context provider used when establishing new connections.
    pub fn set_context_provider(&self, provider: ContextProvider) {
        self.inner.execute(move |_inner, state, _post| {
            state.context_provider = provider;
        });
    }

    /// Advisory validity of a connection, answered by the connector.
    pub fn is_valid(&self, connection: &C) -> bool {
        self.inner.connector.is_valid(connection)
    }

    /// Number of slots that are not removed, including connects in progress.
    pub fn size(&self) -> usize {
        self.inner.counters.size.load(Ordering::Relaxed)
    }

    /// Sum of the weights of the slots counted by [size](Pool::size).
    pub fn capacity(&self) -> usize {
        self.inner.counters.capacity.load(Ordering::Relaxed)
    }

    /// Number of connects in progress.
    pub fn requests(&self) -> usize {
        self.inner.counters.requests.load(Ordering::Relaxed)
    }

    /// Number of pending waiters.
    pub fn waiters(&self) -> usize {
        self.inner.counters.waiters.load(Ordering::Relaxed)
    }
}

impl<C: Clone + Send + 'static> PoolInner<C> {
    fn execute(
        self: &Arc<Self>,
        action: impl FnOnce(&Arc<PoolInner<C>>, &mut PoolState<C>, &mut PostActions) + Send + 'static,
    ) {
        let inner = self.clone();
        self.combiner.submit(Box::new(move |state, post| {
            action(&inner, state, post);
            state.publish(&inner.counters);
        }));
    }

    /// Post one slot event into the serialization domain.
    pub(crate) fn deliver(inner: &Arc<Self>, key: SlotKey, event: SlotEvent<C>) {
        inner.execute(move |inner, state, post| match event {
            SlotEvent::Removed => Self::on_removed(inner, state, post, key),
            SlotEvent::ConcurrencyChanged(concurrency) => {
                Self::on_concurrency_changed(inner, state, post, key, concurrency)
            }
            SlotEvent::ConnectCompleted(result) => {
                Self::on_connect_completed(inner, state, post, key, result)
            }
        });
    }

    /// Return one lease's share of a slot.
    pub(crate) fn recycle(inner: &Arc<Self>, key: SlotKey) {
        inner.execute(move |inner, state, post| {
            let Some(slot) = state.slots.get_mut(key) else {
                // the slot was discarded (pool closed or connection removed and drained)
                debug!("recycle into discarded slot {:?}", key);
                return;
            };
            if slot.used == 0 {
                warn!("recycle underflow on slot {:?}", key);
                return;
            }
            slot.used -= 1;
            match slot.state {
                SlotState::Removed => {
                    if slot.used == 0 {
                        state.slots.remove(key);
                    }
                }
                SlotState::Available => Self::run_matching(inner, state, post),
                SlotState::Connecting => {}
            }
        });
    }

    /// Remove a waiter from both the record table and the fifo.
    fn take_waiter(state: &mut PoolState<C>, id: u64) -> Option<WaiterRecord<C>> {
        let record = state.waiters.remove(&id)?;
        if let Some(position) = state.queue.iter().position(|&w| w == id) {
            state.queue.remove(position);
        }
        Some(record)
    }

    /// The match loop. Runs after every state change; serves the head waiter from the eligible
    /// slots or opens a new connect for it, and keeps going while heads are being served.
    fn run_matching(inner: &Arc<Self>, state: &mut PoolState<C>, post: &mut PostActions) {
        loop {
            if state.closed {
                return;
            }
            let Some(&head) = state.queue.front() else {
                return;
            };
            let Some(record) = state.waiters.get(&head) else {
                debug!("dropping stale queue head {}", head);
                state.queue.pop_front();
                continue;
            };
            let kind = record.kind;
            let mut candidates = Vec::new();
            for (index, slot) in state.slots.iter() {
                if slot.state != SlotState::Available
                    || slot.kind != kind
                    || slot.used >= slot.concurrency
                {
                    continue;
                }
                let Some(connection) = &slot.connection else {
                    continue;
                };
                candidates.push(Candidate {
                    index,
                    connection: connection.clone(),
                    context: slot.context.clone(),
                    concurrency: slot.concurrency,
                    used: slot.used,
                });
            }
            let pending = PendingAcquire {
                context: record.context.clone(),
                kind,
            };
            let picked = if candidates.is_empty() {
                None
            } else {
                match (state.selector.as_ref())(&pending, &candidates) {
                    Some(choice) if choice < candidates.len() => Some(choice),
                    Some(choice) => {
                        warn!("selector returned out of range candidate {}", choice);
                        None
                    }
                    None => None,
                }
            };
            if let Some(choice) = picked {
                let candidate = &candidates[choice];
                let key = state.slots.key_at(candidate.index);
                let Some(record) = Self::take_waiter(state, head) else {
                    continue;
                };
                if let Some(assigned) = record.assigned {
                    // served by another slot, the connect opened for it keeps going unbound
                    if let Some(slot) = state.slots.get_mut(assigned) {
                        slot.bound_waiter = None;
                    }
                }
                if let Some(slot) = state.slots.get_mut(key) {
                    slot.used += 1;
                }
                let lease = Lease::new(inner.clone(), key, candidate.connection.clone());
                let sink = record.sink;
                post.dispatch(&record.context, Box::new(move || sink(Ok(lease))));
                continue;
            }
            if record.assigned.is_some() {
                // the head already has a connect in flight, wait for it
                return;
            }
            if state.kind_weights[kind] + 1 > inner.max[kind] {
                // no budget left for this kind, the head stays queued
                return;
            }
            let slot_context = (state.context_provider.as_ref())(&record.context);
            let key = state.slots.insert(Slot {
                kind,
                weight: 1,
                concurrency: 0,
                used: 0,
                state: SlotState::Connecting,
                context: slot_context.clone(),
                connection: None,
                bound_waiter: Some(head),
            });
            state.kind_weights[kind] += 1;
            state.size += 1;
            state.requests += 1;
            if let Some(record) = state.waiters.get_mut(&head) {
                record.assigned = Some(key);
                if let Some(listener) = &record.listener {
                    listener.on_connect(&Waiter { id: head });
                }
            }
            debug!("connect initiated for kind {} on slot {:?}", kind, key);
            let pool = inner.clone();
            let connector = inner.connector.clone();
            post.run(Box::new(move || {
                let listener = SlotListener {
                    pool: Arc::downgrade(&pool),
                    slot: key,
                };
                let connect_context = slot_context.clone();
                slot_context.spawn(Box::pin(async move {
                    let result = connector.connect(&connect_context, listener).await;
                    PoolInner::deliver(&pool, key, SlotEvent::ConnectCompleted(result));
                }));
            }));
            return;
        }
    }

    fn on_connect_completed(
        inner: &Arc<Self>,
        state: &mut PoolState<C>,
        post: &mut PostActions,
        key: SlotKey,
        result: Result<ConnectResult<C>>,
    ) {
        if state.closed {
            // close captured this slot; its entry goes into the outcome list
            if state.slots.remove(key).is_none() {
                debug!("dropping connect result for discarded slot {:?}", key);
                return;
            }
            let Some(closing) = state.closing.as_mut() else {
                return;
            };
            closing.results.push(result.map(|r| r.connection));
            closing.pending -= 1;
            if closing.pending == 0 {
                if let Some(closing) = state.closing.take() {
                    let sink = closing.sink;
                    let results = closing.results;
                    post.run(Box::new(move || sink(Ok(results))));
                }
            }
            return;
        }
        match result {
            Ok(res) => {
                let connection = res.connection;
                let weight = res.weight.max(1);
                let Some(slot) = state.slots.get_mut(key) else {
                    debug!("dropping connect result for discarded slot {:?}", key);
                    return;
                };
                slot.state = SlotState::Available;
                slot.connection = Some(connection.clone());
                slot.concurrency = res.concurrency;
                slot.weight = weight;
                let kind = slot.kind;
                let concurrency = slot.concurrency;
                let bound = slot.bound_waiter.take();
                state.kind_weights[kind] += weight - 1;
                if state.kind_weights[kind] > inner.max[kind] {
                    warn!(
                        "connector declared weight {} overshooting the kind {} budget",
                        weight, kind
                    );
                }
                state.requests -= 1;
                debug!(
                    "slot {:?} available, kind {} concurrency {}",
                    key, kind, concurrency
                );
                if let Some(waiter_id) = bound {
                    if concurrency >= 1 {
                        // the initiating waiter takes the first lease directly
                        if let Some(record) = Self::take_waiter(state, waiter_id) {
                            if let Some(slot) = state.slots.get_mut(key) {
                                slot.used += 1;
                            }
                            let lease = Lease::new(inner.clone(), key, connection.clone());
                            let sink = record.sink;
                            post.dispatch(&record.context, Box::new(move || sink(Ok(lease))));
                        }
                    } else if let Some(record) = state.waiters.get_mut(&waiter_id) {
                        // admitted unusable; the waiter keeps its place in the fifo
                        record.assigned = None;
                    }
                }
                Self::run_matching(inner, state, post);
            }
            Err(cause) => {
                let Some(slot) = state.slots.remove(key) else {
                    debug!("dropping connect failure for discarded slot {:?}", key);
                    return;
                };
                state.kind_weights[slot.kind] -= slot.weight;
                state.size -= 1;
                state.requests -= 1;
                debug!("connect failed on slot {:?}: {}", key, cause);
                if let Some(waiter_id) = slot.bound_waiter {
                    if let Some(record) = Self::take_waiter(state, waiter_id) {
                        let error =
                            Error::because(ErrorType::ConnectFailed, "connect failed", cause);
                        let sink = record.sink;
                        post.dispatch(&record.context, Box::new(move || sink(Err(error))));
                    }
                }
                // the freed reservation may admit a queued waiter, of any kind
                Self::run_matching(inner, state, post);
            }
        }
    }

    fn on_removed(inner: &Arc<Self>, state: &mut PoolState<C>, post: &mut PostActions, key: SlotKey) {
        if state.closed {
            return;
        }
        let slot_state = match state.slots.get(key) {
            Some(slot) => slot.state,
            None => {
                debug!("dropping remove for discarded slot {:?}", key);
                return;
            }
        };
        match slot_state {
            SlotState::Connecting => {
                let Some(slot) = state.slots.remove(key) else {
                    return;
                };
                state.kind_weights[slot.kind] -= slot.weight;
                state.size -= 1;
                state.requests -= 1;
                if let Some(waiter_id) = slot.bound_waiter {
                    if let Some(record) = Self::take_waiter(state, waiter_id) {
                        let error = Error::explain(
                            ErrorType::ConnectFailed,
                            "connection removed during connect",
                        );
                        let sink = record.sink;
                        post.dispatch(&record.context, Box::new(move || sink(Err(error))));
                    }
                }
                Self::run_matching(inner, state, post);
            }
            SlotState::Available => {
                let Some(slot) = state.slots.get_mut(key) else {
                    return;
                };
                slot.state = SlotState::Removed;
                slot.connection = None;
                let kind = slot.kind;
                let weight = slot.weight;
                let drained = slot.used == 0;
                state.kind_weights[kind] -= weight;
                state.size -= 1;
                if drained {
                    state.slots.remove(key);
                }
                debug!("slot {:?} removed, kind {} weight {} freed", key, kind, weight);
                Self::run_matching(inner, state, post);
            }
            // set_removed is idempotent
            SlotState::Removed => {}
        }
    }

    fn on_concurrency_changed(
        inner: &Arc<Self>,
        state: &mut PoolState<C>,
        post: &mut PostActions,
        key: SlotKey,
        concurrency: u32,
    ) {
        if state.closed {
            return;
        }
        let Some(slot) = state.slots.get_mut(key) else {
            debug!("dropping concurrency change for discarded slot {:?}", key);
            return;
        };
        match slot.state {
            SlotState::Removed => {}
            SlotState::Connecting => slot.concurrency = concurrency,
            SlotState::Available => {
                let old = slot.concurrency;
                slot.concurrency = concurrency;
                if concurrency > old {
                    Self::run_matching(inner, state, post);
                }
            }
        }
    }
}
