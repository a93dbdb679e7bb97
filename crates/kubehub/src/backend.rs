//! Store backend over the API server.

use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use kiln_store::{Backend, StoreError, StoreResult};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::histogram;
use serde_json::Value;
use tracing::debug;

#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, ar: &ApiResource, ns: Option<&str>) -> Api<DynamicObject> {
        match ns {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

fn to_value(obj: &DynamicObject) -> StoreResult<Value> {
    let mut v = serde_json::to_value(obj)?;
    strip_managed_fields(&mut v);
    Ok(v)
}

/// Map API errors onto the store's vocabulary.
fn map_err(ar: &ApiResource, ns: &str, name: &str, err: kube::Error) -> StoreError {
    let key = format!("{ns}/{name}");
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound { kind: ar.kind.clone(), key },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists { kind: ar.kind.clone(), key }
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict { kind: ar.kind.clone(), key, reason: resp.message.clone() }
        }
        kube::Error::Api(resp) if resp.code == 422 => StoreError::Invalid(resp.message.clone()),
        _ => StoreError::Backend(anyhow!(err)),
    }
}

#[async_trait]
impl Backend for KubeBackend {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<Option<Value>> {
        let started = Instant::now();
        let got = self.api(ar, Some(ns)).get_opt(name).await.map_err(|e| map_err(ar, ns, name, e))?;
        histogram!("kube_request_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => "get");
        got.as_ref().map(to_value).transpose()
    }

    async fn list(&self, ar: &ApiResource, ns: Option<&str>) -> StoreResult<Vec<Value>> {
        let started = Instant::now();
        let list = self
            .api(ar, ns)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_err(ar, ns.unwrap_or(""), "", e))?;
        histogram!("kube_request_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => "list");
        list.items.iter().map(to_value).collect()
    }

    async fn create(&self, ar: &ApiResource, ns: &str, obj: Value) -> StoreResult<Value> {
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let created = self
            .api(ar, Some(ns))
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(ar, ns, &name, e))?;
        debug!(kind = %ar.kind, ns = %ns, name = %name, "created");
        to_value(&created)
    }

    async fn replace(&self, ar: &ApiResource, ns: &str, name: &str, obj: Value) -> StoreResult<Value> {
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let replaced = self
            .api(ar, Some(ns))
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(ar, ns, name, e))?;
        to_value(&replaced)
    }

    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<bool> {
        match self.api(ar, Some(ns)).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(map_err(ar, ns, name, e)),
        }
    }

    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, patch: Value) -> StoreResult<Value> {
        let started = Instant::now();
        let patched = self
            .api(ar, Some(ns))
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(ar, ns, name, e))?;
        histogram!("kube_request_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => "patch_status");
        to_value(&patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Kit;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_map_onto_store_errors() {
        let ar = ApiResource::erase::<Kit>(&());
        assert!(map_err(&ar, "ns", "a", api_error(404, "NotFound")).is_not_found());
        assert!(map_err(&ar, "ns", "a", api_error(409, "AlreadyExists")).is_already_exists());
        assert!(map_err(&ar, "ns", "a", api_error(409, "Conflict")).is_conflict());
        assert!(matches!(map_err(&ar, "ns", "a", api_error(500, "InternalError")), StoreError::Backend(_)));
    }

    #[test]
    fn managed_fields_are_dropped() {
        let mut v = serde_json::json!({"metadata": {"name": "a", "managedFields": [{}]}});
        strip_managed_fields(&mut v);
        assert_eq!(v, serde_json::json!({"metadata": {"name": "a"}}));
    }
}
