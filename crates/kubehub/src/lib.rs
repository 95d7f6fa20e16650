//! Vigil kube integration: the remote source adapter over raw list/watch.
//!
//! Deliberately uses the client-level `Api::list`/`Api::watch` primitives
//! rather than `kube::runtime` — driving the protocol (relist, backoff,
//! checkpoints) is the informer's job, not this crate's.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tracing::{debug, info, trace};

use vigil_core::{NotificationStream, ObjectKey, RawEvent, RemoteSource, SourceError, TrackedObject};

/// A dynamic object admitted into the pipeline. Construction goes through
/// `admit`, which validates the identity fields once and captures the key,
/// so `key()` never has to guess at a missing name.
#[derive(Clone, Debug)]
pub struct KubeObject {
    key: ObjectKey,
    inner: DynamicObject,
}

impl KubeObject {
    pub fn into_inner(self) -> DynamicObject {
        self.inner
    }
}

impl std::ops::Deref for KubeObject {
    type Target = DynamicObject;

    fn deref(&self) -> &DynamicObject {
        &self.inner
    }
}

impl TrackedObject for KubeObject {
    fn key(&self) -> ObjectKey {
        self.key.clone()
    }

    fn resource_version(&self) -> Option<&str> {
        self.inner.metadata.resource_version.as_deref()
    }
}

/// Parse a GVK key like `v1/Pod` or `cert-manager.io/v1/Certificate`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Remote source for one GVK, optionally scoped to a namespace.
pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeSource {
    /// Resolve the GVK against discovery and bind the API scope. A namespace
    /// is honored only for namespaced kinds; cluster-scoped kinds ignore it.
    pub async fn new(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) if !ns.is_empty() => Api::namespaced_with(client, ns, &ar),
                _ => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        info!(gvk = gvk_key, ns = ?namespace, namespaced, "kube source bound");
        Ok(Self { api, gvk_key: gvk_key.to_string() })
    }
}

#[async_trait::async_trait]
impl RemoteSource<KubeObject> for KubeSource {
    async fn list(&self) -> Result<(Vec<KubeObject>, String), SourceError> {
        let list = self.api.list(&ListParams::default()).await.map_err(map_client_error)?;
        let checkpoint = list
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| SourceError::Malformed("list response missing resourceVersion".into()))?;
        let mut objects = Vec::with_capacity(list.items.len());
        for obj in list.items {
            objects.push(admit(obj)?);
        }
        debug!(gvk = %self.gvk_key, count = objects.len(), checkpoint = %checkpoint, "listed");
        counter!("vigil_source_lists_total", 1u64);
        Ok((objects, checkpoint))
    }

    async fn watch(&self, from_version: &str) -> Result<NotificationStream<KubeObject>, SourceError> {
        let stream = self
            .api
            .watch(&WatchParams::default(), from_version)
            .await
            .map_err(map_client_error)?;
        counter!("vigil_source_watches_total", 1u64);
        let gvk_key = self.gvk_key.clone();
        let stream = stream.filter_map(move |item| {
            let gvk_key = gvk_key.clone();
            async move {
                match item {
                    Ok(WatchEvent::Added(o)) => Some(admit(o).map(RawEvent::Added)),
                    Ok(WatchEvent::Modified(o)) => Some(admit(o).map(RawEvent::Modified)),
                    Ok(WatchEvent::Deleted(o)) => Some(admit(o).map(RawEvent::Deleted)),
                    Ok(WatchEvent::Bookmark(_)) => {
                        // Not requested; harmless if the server sends one.
                        trace!(gvk = %gvk_key, "ignoring bookmark");
                        None
                    }
                    Ok(WatchEvent::Error(status)) => Some(Err(map_status(status))),
                    Err(e) => Some(Err(map_client_error(e))),
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Gate payloads on the fields the mirror cannot function without.
fn admit(obj: DynamicObject) -> Result<KubeObject, SourceError> {
    let name = match obj.metadata.name.as_deref() {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => return Err(SourceError::Malformed("object missing metadata.name".into())),
    };
    let key = ObjectKey { namespace: obj.metadata.namespace.clone(), name };
    if obj.metadata.resource_version.as_deref().unwrap_or("").is_empty() {
        return Err(SourceError::Malformed(format!(
            "object {key} missing metadata.resourceVersion"
        )));
    }
    Ok(KubeObject { key, inner: obj })
}

fn map_client_error(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(status) => map_status(status),
        kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

fn map_status(status: ErrorResponse) -> SourceError {
    match status.code {
        410 => SourceError::Expired(status.message),
        401 | 403 => SourceError::Unauthorized(status.message),
        _ => SourceError::Transient(format!("{} ({})", status.message, status.code)),
    }
}
