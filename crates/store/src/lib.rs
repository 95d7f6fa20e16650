//! Vigil store: coalescing delta queue, snapshot cache, event dispatch.
//!
//! The reflector pushes [`ChangeRecord`]s into a [`DeltaQueue`]; a single
//! dispatcher task drains the queue, mutates the [`Store`] and then notifies
//! observers. Readers only ever see immutable snapshots swapped in whole.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use vigil_core::{ChangeRecord, Event, EventHandler, ObjectKey, TrackedObject};

/// Immutable point-in-time view of the mirror. `epoch` increments on every
/// swap and never goes backwards.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<T> {
    pub epoch: u64,
    items: FxHashMap<ObjectKey, T>,
}

impl<T> Default for StoreSnapshot<T> {
    fn default() -> Self {
        Self { epoch: 0, items: FxHashMap::default() }
    }
}

impl<T: TrackedObject> StoreSnapshot<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<&T> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.items.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &T)> {
        self.items.iter()
    }
}

/// Keyed mirror of the last known good state of every tracked object.
/// Mutated exclusively by the dispatcher; read concurrently by anyone.
pub struct Store<T> {
    snap: ArcSwap<StoreSnapshot<T>>,
}

impl<T: TrackedObject> Store<T> {
    pub fn new() -> Self {
        Self { snap: ArcSwap::from_pointee(StoreSnapshot::default()) }
    }

    /// Cheap handle to the current snapshot.
    pub fn current(&self) -> Arc<StoreSnapshot<T>> {
        self.snap.load_full()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.current().get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.current().items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    fn publish(&self, epoch: u64, items: FxHashMap<ObjectKey, T>) {
        self.snap.store(Arc::new(StoreSnapshot { epoch, items }));
    }
}

impl<T: TrackedObject> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueInner<T> {
    entries: FxHashMap<ObjectKey, ChangeRecord<T>>,
    order: VecDeque<ObjectKey>,
    /// Entries from the first replace() still waiting to be popped. `None`
    /// until the first list has been enqueued.
    initial_remaining: Option<usize>,
}

/// Coalescing FIFO keyed by object identity: at most one pending record per
/// key, FIFO across keys, per-key changes collapsed in arrival order.
pub struct DeltaQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
}

impl<T: TrackedObject> DeltaQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: FxHashMap::default(),
                order: VecDeque::new(),
                initial_remaining: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// True once every entry of the first list has been popped at least once.
    pub fn has_synced(&self) -> bool {
        self.lock().initial_remaining == Some(0)
    }

    /// Append a change, collapsing with any pending record for the same key.
    pub fn push(&self, record: ChangeRecord<T>) {
        {
            let mut inner = self.lock();
            push_locked(&mut inner, record);
            gauge!("vigil_queue_depth", inner.entries.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Atomically enqueue the diff between a fresh full list and current
    /// knowledge (cache contents plus pending entries). Objects missing from
    /// the list become tombstoned deletes carrying their last known state.
    pub fn replace(&self, listed: Vec<T>, store: &Store<T>) {
        let mut listed_keys: FxHashMap<ObjectKey, ()> = FxHashMap::default();
        for obj in &listed {
            listed_keys.insert(obj.key(), ());
        }
        {
            let mut inner = self.lock();
            // Snapshot read under the queue lock: entries applied by the
            // dispatcher are published before their pop completes, so cache
            // plus pending entries is exactly current knowledge here.
            let cache = store.current();

            // Deletions first: anything we know about that the list no longer
            // reports. The tombstone carries the freshest copy we hold.
            let mut gone: Vec<T> = Vec::new();
            for (key, obj) in cache.iter() {
                if !listed_keys.contains_key(key) {
                    let last = inner
                        .entries
                        .get(key)
                        .map(|r| r.latest().clone())
                        .unwrap_or_else(|| obj.clone());
                    gone.push(last);
                }
            }
            for (key, rec) in inner.entries.iter() {
                if !listed_keys.contains_key(key) && !cache.contains(key) {
                    gone.push(rec.latest().clone());
                }
            }
            for object in gone {
                push_locked(&mut inner, ChangeRecord::Deleted { object, observed: false });
            }
            for obj in listed {
                push_locked(&mut inner, ChangeRecord::Added(obj));
            }
            if inner.initial_remaining.is_none() {
                inner.initial_remaining = Some(inner.entries.len());
                debug!(count = inner.entries.len(), "initial population enqueued");
            }
            counter!("vigil_relists_total", 1u64);
            gauge!("vigil_queue_depth", inner.entries.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Remove and return the oldest pending entry, blocking while the queue
    /// is empty. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<(ObjectKey, ChangeRecord<T>)> {
        self.process_next(cancel, |key, record| (key, record)).await
    }

    /// Pop the oldest entry and run `apply` on it while still holding the
    /// queue lock. A concurrent `replace` can therefore never observe a
    /// window where an in-flight entry is in neither the queue nor the
    /// cache. `apply` must not block.
    pub async fn process_next<R>(
        &self,
        cancel: &CancellationToken,
        mut apply: impl FnMut(ObjectKey, ChangeRecord<T>) -> R,
    ) -> Option<R> {
        loop {
            // Cancellation wins over a non-empty backlog: once the token is
            // cancelled nothing further may be popped or applied.
            if cancel.is_cancelled() {
                return None;
            }
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(key) = inner.order.pop_front() {
                    let record = inner
                        .entries
                        .remove(&key)
                        .unwrap_or_else(|| unreachable!("order and entries out of step"));
                    if let Some(n) = inner.initial_remaining {
                        inner.initial_remaining = Some(n.saturating_sub(1));
                    }
                    gauge!("vigil_queue_depth", inner.entries.len() as f64);
                    return Some(apply(key, record));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner<T>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: TrackedObject> Default for DeltaQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn push_locked<T: TrackedObject>(inner: &mut QueueInner<T>, record: ChangeRecord<T>) {
    let key = record.key();
    counter!("vigil_deltas_pushed_total", 1u64);
    match inner.entries.remove(&key) {
        None => {
            inner.order.push_back(key.clone());
            inner.entries.insert(key, record);
        }
        Some(existing) => {
            counter!("vigil_deltas_coalesced_total", 1u64);
            let collapsed = collapse(existing, record);
            inner.entries.insert(key, collapsed);
        }
    }
}

/// Collapse two pending records for one key into the single record whose
/// dispatch is equivalent to dispatching both in order. Kind correctness is
/// re-checked against actual store state at dispatch time, so a re-add after
/// a pending delete may legitimately come out as `Added` here.
fn collapse<T: TrackedObject>(existing: ChangeRecord<T>, incoming: ChangeRecord<T>) -> ChangeRecord<T> {
    use ChangeRecord::*;
    match (existing, incoming) {
        // A delete supersedes whatever was pending. Prefer an observed
        // delete's payload (the server's final state) over a tombstone.
        (Deleted { object, observed: true }, Deleted { observed: false, .. }) => {
            Deleted { object, observed: true }
        }
        (_, del @ Deleted { .. }) => del,

        // The consumer has not seen the Add yet, so later state folds into it.
        (Added(_), Added(new)) | (Added(_), Updated { new, .. }) => Added(new),

        // Keep the oldest `old` so observers see the full span of the change.
        (Updated { old, .. }, Updated { new, .. }) | (Updated { old, .. }, Added(new)) => {
            Updated { old, new }
        }

        // Re-add after a pending (undispatched) delete.
        (Deleted { .. }, Added(new)) | (Deleted { .. }, Updated { new, .. }) => Added(new),
    }
}

/// Readiness gate: flips false→true exactly once, after the initial list has
/// been fully applied to the store and dispatched.
#[derive(Clone)]
pub struct SyncGate {
    rx: watch::Receiver<bool>,
}

impl SyncGate {
    pub fn has_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate opens. Returns false if `cancel` fires first or
    /// the dispatcher is gone without ever syncing.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return *rx.borrow();
                    }
                }
            }
        }
    }
}

pub fn sync_gate() -> (watch::Sender<bool>, SyncGate) {
    let (tx, rx) = watch::channel(false);
    (tx, SyncGate { rx })
}

/// Spawn the dispatcher task: pop → reconcile against the store → publish a
/// new snapshot → notify observers. Stops after `cancel` fires; no store
/// mutation or observer call happens past that point.
pub fn spawn_dispatcher<T: TrackedObject>(
    queue: Arc<DeltaQueue<T>>,
    store: Arc<Store<T>>,
    handlers: Arc<Vec<Box<dyn EventHandler<T>>>>,
    sync_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut items: FxHashMap<ObjectKey, T> = FxHashMap::default();
        let mut epoch: u64 = 0;
        loop {
            // The cache mutation and snapshot swap run under the queue lock
            // (see process_next); observer dispatch happens after release so
            // a slow observer cannot stall producers.
            let processed = queue
                .process_next(&cancel, |key, record| {
                    let event = reconcile(&key, record, &items);
                    if let Some(event) = &event {
                        match event {
                            Event::Added(o) | Event::Updated { new: o, .. } => {
                                items.insert(key.clone(), o.clone());
                            }
                            Event::Deleted { .. } => {
                                items.remove(&key);
                            }
                        }
                        epoch += 1;
                        store.publish(epoch, items.clone());
                        counter!("vigil_events_dispatched_total", 1u64, "kind" => event.kind());
                        trace!(key = %key, kind = event.kind(), epoch, "event applied");
                    }
                    event
                })
                .await;
            let Some(maybe_event) = processed else { break };
            if let Some(event) = maybe_event {
                dispatch(&handlers, &event);
            }
            if queue.has_synced() && !*sync_tx.borrow() {
                let _ = sync_tx.send(true);
                info!(objects = items.len(), "initial sync complete");
            }
        }
        debug!("dispatcher stopped");
    })
}

/// Turn a dequeued record into the event that is actually true with respect
/// to current cache contents, or `None` when it would be a no-op.
fn reconcile<T: TrackedObject>(
    key: &ObjectKey,
    record: ChangeRecord<T>,
    items: &FxHashMap<ObjectKey, T>,
) -> Option<Event<T>> {
    match record {
        ChangeRecord::Added(new) | ChangeRecord::Updated { new, .. } => match items.get(key) {
            Some(old) => {
                if old.resource_version().is_some()
                    && old.resource_version() == new.resource_version()
                {
                    // Replay of a state already mirrored (e.g. relist of an
                    // unchanged object).
                    None
                } else {
                    Some(Event::Updated { old: old.clone(), new })
                }
            }
            None => Some(Event::Added(new)),
        },
        ChangeRecord::Deleted { object, observed } => {
            if items.contains_key(key) {
                Some(Event::Deleted { object, observed })
            } else {
                // Delete for a key the cache never saw; nothing to tell.
                None
            }
        }
    }
}

fn dispatch<T: TrackedObject>(handlers: &[Box<dyn EventHandler<T>>], event: &Event<T>) {
    for (idx, handler) in handlers.iter().enumerate() {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_event(event)));
        if outcome.is_err() {
            // The store is already consistent; a failing observer only loses
            // its own notification.
            counter!("vigil_handler_panics_total", 1u64);
            error!(handler = idx, key = %event.key(), kind = event.kind(), "observer panicked");
        }
    }
}
