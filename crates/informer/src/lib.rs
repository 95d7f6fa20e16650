//! Vigil informer: drives the list-then-watch protocol against a
//! [`RemoteSource`] and keeps a [`Store`] mirrored through the delta queue.
//!
//! Layout mirrors the flow: `Reflector` produces change records, the store
//! crate's dispatcher consumes them, and [`Informer`] wires the two tasks
//! together under one cancellation token.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::{
    BackoffPolicy, ChangeRecord, EventHandler, RawEvent, RemoteSource, SourceError, TrackedObject,
};
use vigil_store::{spawn_dispatcher, sync_gate, DeltaQueue, Store, SyncGate};

/// Why the watching state was abandoned.
enum WatchOutcome {
    /// Checkpoint no longer usable (expired, malformed data, or too many
    /// consecutive transient failures): go back to Listing.
    Relist,
    /// Cancellation observed.
    Cancelled,
}

/// Drives `Listing → Watching → (error) → Listing` until cancelled or a
/// fatal error surfaces. Owns the checkpoint; pushes every observed change
/// into the queue before reading the next notification.
struct Reflector<T, S> {
    source: Arc<S>,
    queue: Arc<DeltaQueue<T>>,
    store: Arc<Store<T>>,
    backoff: BackoffPolicy,
}

impl<T, S> Reflector<T, S>
where
    T: TrackedObject,
    S: RemoteSource<T>,
{
    async fn run(self, cancel: CancellationToken) -> Result<(), SourceError> {
        loop {
            let checkpoint = match self.relist(&cancel).await? {
                Some(cp) => cp,
                None => return Ok(()),
            };
            match self.watch_from(checkpoint, &cancel).await? {
                WatchOutcome::Relist => continue,
                WatchOutcome::Cancelled => return Ok(()),
            }
        }
    }

    /// Fetch a full list and enqueue the repair diff atomically. Returns the
    /// new checkpoint, or `None` on cancellation. Transient list failures
    /// back off and retry forever; only `Unauthorized` escapes.
    async fn relist(&self, cancel: &CancellationToken) -> Result<Option<String>, SourceError> {
        let mut attempt: u32 = 0;
        loop {
            let listing = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                res = self.source.list() => res,
            };
            match listing {
                Ok((objects, checkpoint)) => {
                    info!(count = objects.len(), checkpoint = %checkpoint, "list complete");
                    self.queue.replace(objects, &self.store);
                    return Ok(Some(checkpoint));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    counter!("vigil_list_errors_total", 1u64);
                    let delay = self.backoff.delay(attempt);
                    warn!(error = %e, attempt, ?delay, "list failed; backing off");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Watch from `checkpoint`, advancing it per notification. The checkpoint
    /// write and the queue push happen back-to-back on this single task, so
    /// no two notifications for one key can interleave.
    async fn watch_from(
        &self,
        mut checkpoint: String,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, SourceError> {
        let mut failures: u32 = 0;
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchOutcome::Cancelled),
                res = self.source.watch(&checkpoint) => res,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(SourceError::Expired(msg)) => {
                    info!(checkpoint = %checkpoint, %msg, "checkpoint expired; relisting");
                    return Ok(WatchOutcome::Relist);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    counter!("vigil_watch_errors_total", 1u64);
                    if failures > self.backoff.max_retries {
                        warn!(error = %e, failures, "watch keeps failing; falling back to relist");
                        return Ok(WatchOutcome::Relist);
                    }
                    let delay = self.backoff.delay(failures);
                    warn!(error = %e, attempt = failures, ?delay, "watch failed; backing off");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(WatchOutcome::Cancelled);
                    }
                    continue;
                }
            };
            debug!(checkpoint = %checkpoint, "watch established");

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(WatchOutcome::Cancelled),
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(raw)) => {
                        failures = 0;
                        let Some(rv) = raw.object().resource_version() else {
                            warn!("notification without resourceVersion; relisting");
                            return Ok(WatchOutcome::Relist);
                        };
                        checkpoint = rv.to_string();
                        self.queue.push(self.to_record(raw));
                    }
                    Some(Err(SourceError::Expired(msg))) => {
                        info!(checkpoint = %checkpoint, %msg, "checkpoint expired mid-stream; relisting");
                        return Ok(WatchOutcome::Relist);
                    }
                    Some(Err(e)) if e.is_fatal() => return Err(e),
                    Some(Err(SourceError::Malformed(msg))) => {
                        // The checkpoint may silently be desynced past an
                        // undecodable notification; do not trust it.
                        warn!(%msg, "malformed notification; forcing relist");
                        counter!("vigil_malformed_total", 1u64);
                        return Ok(WatchOutcome::Relist);
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        counter!("vigil_watch_errors_total", 1u64);
                        if failures > self.backoff.max_retries {
                            warn!(error = %e, failures, "stream keeps failing; falling back to relist");
                            return Ok(WatchOutcome::Relist);
                        }
                        let delay = self.backoff.delay(failures);
                        warn!(error = %e, attempt = failures, ?delay, "stream error; backing off");
                        if !sleep_or_cancel(delay, cancel).await {
                            return Ok(WatchOutcome::Cancelled);
                        }
                        break; // reopen the watch from the checkpoint
                    }
                    None => {
                        failures += 1;
                        if failures > self.backoff.max_retries {
                            debug!(failures, "stream keeps closing; falling back to relist");
                            return Ok(WatchOutcome::Relist);
                        }
                        let delay = self.backoff.delay(failures);
                        debug!(?delay, "watch stream ended; reopening");
                        if !sleep_or_cancel(delay, cancel).await {
                            return Ok(WatchOutcome::Cancelled);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn to_record(&self, raw: RawEvent<T>) -> ChangeRecord<T> {
        match raw {
            RawEvent::Added(o) => ChangeRecord::Added(o),
            RawEvent::Modified(new) => {
                // Last known good state; the dispatcher substitutes its own
                // authoritative copy if the cache disagrees by then.
                let old = self.store.get(&new.key()).unwrap_or_else(|| new.clone());
                ChangeRecord::Updated { old, new }
            }
            RawEvent::Deleted(object) => ChangeRecord::Deleted { object, observed: true },
        }
    }
}

/// False if cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Builder for a single-resource watch instance. Handlers must be registered
/// before `start`; the running informer takes no further registrations.
pub struct Informer<T, S> {
    source: Arc<S>,
    backoff: BackoffPolicy,
    handlers: Vec<Box<dyn EventHandler<T>>>,
}

impl<T, S> Informer<T, S>
where
    T: TrackedObject,
    S: RemoteSource<T>,
{
    pub fn new(source: S) -> Self {
        Self { source: Arc::new(source), backoff: BackoffPolicy::default(), handlers: Vec::new() }
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn register<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<T> + 'static,
    {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Spawn the reflector and dispatcher tasks and hand back their handle.
    pub fn start(self) -> InformerHandle<T> {
        let cancel = CancellationToken::new();
        let queue = Arc::new(DeltaQueue::new());
        let store = Arc::new(Store::new());
        let (sync_tx, gate) = sync_gate();

        let dispatcher = spawn_dispatcher(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::new(self.handlers),
            sync_tx,
            cancel.clone(),
        );

        let reflector = Reflector {
            source: self.source,
            queue,
            store: Arc::clone(&store),
            backoff: self.backoff,
        };
        let reflector = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let outcome = reflector.run(cancel.clone()).await;
                // A terminal source error must release sync waiters and stop
                // the dispatcher, not strand them behind a dead reflector.
                cancel.cancel();
                outcome
            }
        });

        InformerHandle { store, gate, cancel, reflector, dispatcher }
    }
}

/// Running watch instance: read access, readiness, lifecycle.
pub struct InformerHandle<T> {
    store: Arc<Store<T>>,
    gate: SyncGate,
    cancel: CancellationToken,
    reflector: JoinHandle<Result<(), SourceError>>,
    dispatcher: JoinHandle<()>,
}

impl<T: TrackedObject> InformerHandle<T> {
    /// Read-only view of the mirror. Keeps serving last-known state through
    /// reconnects and relists.
    pub fn store(&self) -> Arc<Store<T>> {
        Arc::clone(&self.store)
    }

    pub fn sync_gate(&self) -> SyncGate {
        self.gate.clone()
    }

    pub fn has_synced(&self) -> bool {
        self.gate.has_synced()
    }

    /// Block until the initial list has been fully applied and dispatched.
    /// Returns false if the informer is cancelled first.
    pub async fn wait_for_sync(&self) -> bool {
        self.gate.wait_for_sync(&self.cancel).await
    }

    /// Token shared by both tasks; external shutdown initiators cancel this.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancellation or a fatal source error. Always tears both
    /// tasks down before returning; the dispatcher makes no further store
    /// mutation or observer call afterwards.
    pub async fn join(mut self) -> Result<(), SourceError> {
        let outcome = match (&mut self.reflector).await {
            Ok(res) => res,
            Err(join_err) => {
                error!(error = %join_err, "reflector task aborted");
                Ok(())
            }
        };
        self.cancel.cancel();
        let _ = self.dispatcher.await;
        outcome
    }

    /// Cancel and wait for both tasks to finish.
    pub async fn shutdown(self) -> Result<(), SourceError> {
        self.cancel.cancel();
        self.join().await
    }
}
