//! Vigil core types: object identity, change records, errors, backoff.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use futures::stream::BoxStream;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Stable identity of a tracked object: `{namespace, name}`.
/// Cluster-scoped resources carry no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Minimal contract an object must satisfy to be mirrored.
///
/// The source adapter is responsible for rejecting payloads without a usable
/// name before they enter the pipeline, so `key()` is total here.
pub trait TrackedObject: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    /// Opaque checkpoint token assigned by the control plane. `None` only for
    /// synthesized payloads (e.g. test fixtures); live notifications always
    /// carry one or are rejected as malformed upstream.
    fn resource_version(&self) -> Option<&str>;
}

/// One logical change to a tracked object, as produced by the reflector.
#[derive(Debug, Clone)]
pub enum ChangeRecord<T> {
    Added(T),
    Updated { old: T, new: T },
    /// `observed` is false when the delete was inferred from a relist
    /// (tombstone reconstructed from the last cached copy) rather than seen
    /// live on the watch stream.
    Deleted { object: T, observed: bool },
}

impl<T: TrackedObject> ChangeRecord<T> {
    pub fn key(&self) -> ObjectKey {
        match self {
            ChangeRecord::Added(o) => o.key(),
            ChangeRecord::Updated { new, .. } => new.key(),
            ChangeRecord::Deleted { object, .. } => object.key(),
        }
    }

    /// Latest object state this record carries.
    pub fn latest(&self) -> &T {
        match self {
            ChangeRecord::Added(o) => o,
            ChangeRecord::Updated { new, .. } => new,
            ChangeRecord::Deleted { object, .. } => object,
        }
    }
}

/// Event delivered to observers after the cache has been updated.
#[derive(Debug, Clone)]
pub enum Event<T> {
    Added(T),
    Updated { old: T, new: T },
    /// `observed` is false when the delete was inferred from a relist; the
    /// payload is then the last cached copy, not a server-final state.
    Deleted { object: T, observed: bool },
}

impl<T: TrackedObject> Event<T> {
    pub fn key(&self) -> ObjectKey {
        match self {
            Event::Added(o) => o.key(),
            Event::Updated { new, .. } => new.key(),
            Event::Deleted { object, .. } => object.key(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Added(_) => "added",
            Event::Updated { .. } => "updated",
            Event::Deleted { .. } => "deleted",
        }
    }
}

/// Observer callback. Invoked sequentially, in registration order, after the
/// cache store already reflects the event.
pub trait EventHandler<T>: Send + Sync {
    fn on_event(&self, event: &Event<T>);
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(&Event<T>) + Send + Sync,
{
    fn on_event(&self, event: &Event<T>) {
        self(event)
    }
}

/// Failure taxonomy of the remote source boundary.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Retryable network-level failure; triggers backoff.
    #[error("transient connection error: {0}")]
    Transient(String),
    /// The checkpoint is too old to resume a watch from; a full relist is
    /// required. Not recoverable by reconnecting alone.
    #[error("checkpoint expired: {0}")]
    Expired(String),
    /// Fatal: retrying cannot succeed without external remediation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A notification that could not be decoded; the checkpoint can no longer
    /// be trusted and a relist is forced.
    #[error("malformed notification: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unauthorized(_))
    }
}

/// Raw notification as it arrives off the wire, before any coalescing.
#[derive(Debug, Clone)]
pub enum RawEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> RawEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            RawEvent::Added(o) | RawEvent::Modified(o) | RawEvent::Deleted(o) => o,
        }
    }
}

pub type NotificationStream<T> = BoxStream<'static, Result<RawEvent<T>, SourceError>>;

/// Boundary translation of the control plane's list/watch primitives.
/// Purely a protocol adapter: no retry logic lives behind this trait.
#[async_trait::async_trait]
pub trait RemoteSource<T: TrackedObject>: Send + Sync + 'static {
    /// Full snapshot of the tracked set plus the checkpoint it was taken at.
    async fn list(&self) -> Result<(Vec<T>, String), SourceError>;

    /// Open a notification stream resuming from `from_version`. Fails with
    /// [`SourceError::Expired`] when the checkpoint is too old to resume
    /// from, which callers must treat as "relist required".
    async fn watch(&self, from_version: &str) -> Result<NotificationStream<T>, SourceError>;
}

/// Exponential backoff template with full jitter and a cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Consecutive transient failures tolerated before falling back to a
    /// full relist.
    pub max_retries: u32,
    /// Backoff base (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum backoff (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl BackoffPolicy {
    /// Jittered delay for the given 1-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
            .max(1);
        let jittered = rand::thread_rng().gen_range(raw / 2..=raw);
        Duration::from_millis(jittered)
    }
}
