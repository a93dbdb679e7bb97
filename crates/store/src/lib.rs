//! kiln store: typed resource access over a pluggable backend.
//!
//! Backends speak JSON against an `ApiResource`; `Store` is the typed facade
//! the engine uses. Every object carries a resource version (an opaque
//! optimistic-concurrency token) and a generation that only moves when the
//! spec changes.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::{core::ApiResource, Resource, ResourceExt};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub mod memory;
pub mod merge;

pub use memory::{MemoryBackend, PatchRecord, StoreEvent, StoreEventKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
    #[error("conflict on {kind} {key}: {reason}")]
    Conflict { kind: String, key: String, reason: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Anything the typed facade can move in and out of a backend.
pub trait Object: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Object for T where T: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Untyped CRUD over namespaced objects.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<Option<Value>>;
    /// All objects of the kind, optionally restricted to one namespace.
    async fn list(&self, ar: &ApiResource, ns: Option<&str>) -> StoreResult<Vec<Value>>;
    async fn create(&self, ar: &ApiResource, ns: &str, obj: Value) -> StoreResult<Value>;
    /// Replace the object but not its status; a `metadata.resourceVersion` in `obj` is a precondition.
    async fn replace(&self, ar: &ApiResource, ns: &str, name: &str, obj: Value) -> StoreResult<Value>;
    /// `Ok(false)` when nothing was there. Owned objects are deleted in the background.
    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<bool>;
    /// Merge-patch the status subresource; a `metadata.resourceVersion` in `patch` is a precondition.
    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, patch: Value) -> StoreResult<Value>;
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self { Self { backend } }

    /// Store over a fresh in-memory backend; the backend handle is returned for inspection.
    pub fn memory() -> (Self, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (Self::new(backend.clone()), backend)
    }

    pub async fn get<K: Object>(&self, ns: &str, name: &str) -> StoreResult<Option<K>> {
        let ar = ApiResource::erase::<K>(&());
        let started = Instant::now();
        let got = self.backend.get(&ar, ns, name).await;
        histogram!("store_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match got? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn list<K: Object>(&self, ns: Option<&str>) -> StoreResult<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        let items = self.backend.list(&ar, ns).await?;
        items.into_iter().map(|v| serde_json::from_value(v).map_err(StoreError::from)).collect()
    }

    pub async fn create<K: Object>(&self, obj: &K) -> StoreResult<K> {
        let ar = ApiResource::erase::<K>(&());
        let ns = namespace_of(obj)?;
        let created = self.backend.create(&ar, &ns, to_value(&ar, obj)?).await?;
        counter!("store_writes_total", 1u64, "op" => "create");
        Ok(serde_json::from_value(created)?)
    }

    pub async fn replace<K: Object>(&self, obj: &K) -> StoreResult<K> {
        let ar = ApiResource::erase::<K>(&());
        let ns = namespace_of(obj)?;
        let name = obj.name_any();
        let replaced = self.backend.replace(&ar, &ns, &name, to_value(&ar, obj)?).await?;
        counter!("store_writes_total", 1u64, "op" => "replace");
        Ok(serde_json::from_value(replaced)?)
    }

    pub async fn delete<K: Object>(&self, ns: &str, name: &str) -> StoreResult<bool> {
        let ar = ApiResource::erase::<K>(&());
        let deleted = self.backend.delete(&ar, ns, name).await?;
        counter!("store_writes_total", 1u64, "op" => "delete");
        Ok(deleted)
    }

    /// `patch` is a whole merge-patch document, e.g. `{"metadata":{..},"status":{..}}`.
    pub async fn patch_status<K: Object>(&self, ns: &str, name: &str, patch: Value) -> StoreResult<K> {
        let ar = ApiResource::erase::<K>(&());
        let patched = self.backend.patch_status(&ar, ns, name, patch).await?;
        counter!("store_writes_total", 1u64, "op" => "patch_status");
        Ok(serde_json::from_value(patched)?)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> StoreResult<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Invalid(format!("{} has no namespace", obj.meta().name.as_deref().unwrap_or(""))))
}

/// Serialize with `apiVersion`/`kind` filled in; not every type emits them.
fn to_value<K: Object>(ar: &ApiResource, obj: &K) -> StoreResult<Value> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(map) = v.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Value::String(ar.api_version.clone()));
        map.entry("kind").or_insert_with(|| Value::String(ar.kind.clone()));
    }
    Ok(v)
}
