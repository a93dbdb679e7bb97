//! In-process backend: the reference implementation used by tests and dry runs.

use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use kiln_core::ObjectKey;
use kube::core::ApiResource;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{merge, Backend, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Applied,
    Deleted,
}

/// Change notification; `object` is the state after the change (before, for deletions).
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub api_version: String,
    pub kind: String,
    pub key: ObjectKey,
    pub event: StoreEventKind,
    pub object: Value,
}

/// One status patch as received by the backend.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub kind: String,
    pub key: ObjectKey,
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot {
    api_version: String,
    kind: String,
    key: ObjectKey,
}

impl Slot {
    fn new(ar: &ApiResource, ns: &str, name: &str) -> Self {
        Self { api_version: ar.api_version.clone(), kind: ar.kind.clone(), key: ObjectKey::new(ns, name) }
    }
}

#[derive(Default)]
struct State {
    objects: FxHashMap<Slot, Value>,
    /// owner uid -> dependants
    owned: FxHashMap<String, FxHashSet<Slot>>,
    version: u64,
    patches: Vec<PatchRecord>,
    fail_patches: u32,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn index_owners(&mut self, slot: &Slot, obj: &Value) {
        for uid in owner_uids(obj) {
            self.owned.entry(uid).or_default().insert(slot.clone());
        }
    }

    fn unindex_owners(&mut self, slot: &Slot, obj: &Value) {
        for uid in owner_uids(obj) {
            if let Some(set) = self.owned.get_mut(&uid) {
                set.remove(slot);
                if set.is_empty() {
                    self.owned.remove(&uid);
                }
            }
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { state: Mutex::new(State::default()), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> { self.events.subscribe() }

    /// Every status patch received so far, oldest first.
    pub fn patches(&self) -> Vec<PatchRecord> {
        self.state.lock().map(|s| s.patches.clone()).unwrap_or_default()
    }

    pub fn patch_count(&self) -> usize { self.state.lock().map(|s| s.patches.len()).unwrap_or(0) }

    /// Make the next `n` status patches fail with a backend error.
    pub fn fail_next_patches(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_patches = n;
        }
    }

    pub fn len(&self) -> usize { self.state.lock().map(|s| s.objects.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
    }

    fn emit(&self, slot: &Slot, event: StoreEventKind, object: Value) {
        let _ = self.events.send(StoreEvent {
            api_version: slot.api_version.clone(),
            kind: slot.kind.clone(),
            key: slot.key.clone(),
            event,
            object,
        });
    }

    /// Remove `slot` and, transitively, everything it owns.
    fn reap(&self, state: &mut State, slot: &Slot) -> Vec<(Slot, Value)> {
        let mut removed = Vec::new();
        let mut pending = vec![slot.clone()];
        while let Some(next) = pending.pop() {
            let Some(obj) = state.objects.remove(&next) else { continue };
            state.unindex_owners(&next, &obj);
            if let Some(uid) = uid_of(&obj) {
                if let Some(deps) = state.owned.remove(&uid) {
                    pending.extend(deps);
                }
            }
            removed.push((next, obj));
        }
        removed
    }
}

fn uid_of(obj: &Value) -> Option<String> {
    obj.pointer("/metadata/uid").and_then(Value::as_str).map(str::to_string)
}

fn resource_version_of(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn owner_uids(obj: &Value) -> Vec<String> {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| refs.iter().filter_map(|r| r.get("uid").and_then(Value::as_str)).map(str::to_string).collect())
        .unwrap_or_default()
}

/// The part of an object whose change bumps its generation.
fn desired_part(obj: &Value) -> Value {
    match obj.get("spec") {
        Some(spec) => spec.clone(),
        None => {
            let mut rest = obj.clone();
            if let Some(map) = rest.as_object_mut() {
                map.remove("metadata");
                map.remove("status");
            }
            rest
        }
    }
}

fn set_meta(obj: &mut Value, field: &str, value: Value) {
    if !obj.get("metadata").map(Value::is_object).unwrap_or(false) {
        obj["metadata"] = json!({});
    }
    obj["metadata"][field] = value;
}

fn conflict(slot: &Slot, reason: impl Into<String>) -> StoreError {
    StoreError::Conflict { kind: slot.kind.clone(), key: slot.key.to_string(), reason: reason.into() }
}

fn not_found(slot: &Slot) -> StoreError {
    StoreError::NotFound { kind: slot.kind.clone(), key: slot.key.to_string() }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<Option<Value>> {
        let state = self.lock()?;
        Ok(state.objects.get(&Slot::new(ar, ns, name)).cloned())
    }

    async fn list(&self, ar: &ApiResource, ns: Option<&str>) -> StoreResult<Vec<Value>> {
        let state = self.lock()?;
        let mut out: Vec<(&Slot, &Value)> = state
            .objects
            .iter()
            .filter(|(s, _)| s.api_version == ar.api_version && s.kind == ar.kind)
            .filter(|(s, _)| ns.map(|n| s.key.namespace == n).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        Ok(out.into_iter().map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, ar: &ApiResource, ns: &str, mut obj: Value) -> StoreResult<Value> {
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Invalid(format!("{} without metadata.name", ar.kind)))?;
        let slot = Slot::new(ar, ns, &name);
        let mut state = self.lock()?;
        if state.objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists { kind: slot.kind.clone(), key: slot.key.to_string() });
        }
        if let Some(map) = obj.as_object_mut() {
            map.remove("status");
        }
        let rv = state.next_version();
        set_meta(&mut obj, "namespace", json!(ns));
        set_meta(&mut obj, "uid", json!(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut obj, "resourceVersion", json!(rv));
        set_meta(&mut obj, "generation", json!(1));
        set_meta(&mut obj, "creationTimestamp", json!(chrono::Utc::now().to_rfc3339()));
        state.index_owners(&slot, &obj);
        state.objects.insert(slot.clone(), obj.clone());
        drop(state);
        debug!(kind = %slot.kind, key = %slot.key, "created");
        self.emit(&slot, StoreEventKind::Applied, obj.clone());
        Ok(obj)
    }

    async fn replace(&self, ar: &ApiResource, ns: &str, name: &str, mut obj: Value) -> StoreResult<Value> {
        let slot = Slot::new(ar, ns, name);
        let mut state = self.lock()?;
        let current = state.objects.get(&slot).cloned().ok_or_else(|| not_found(&slot))?;
        let current_rv = resource_version_of(&current).unwrap_or("").to_string();
        if let Some(expected) = resource_version_of(&obj) {
            if expected != current_rv {
                return Err(conflict(&slot, format!("resourceVersion {expected} is stale (now {current_rv})")));
            }
        }
        let generation = current.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
        let generation = if desired_part(&current) != desired_part(&obj) { generation + 1 } else { generation };
        if let Some(map) = obj.as_object_mut() {
            match current.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        for field in ["uid", "creationTimestamp"] {
            if let Some(v) = current.pointer(&format!("/metadata/{field}")) {
                set_meta(&mut obj, field, v.clone());
            }
        }
        let rv = state.next_version();
        set_meta(&mut obj, "namespace", json!(ns));
        set_meta(&mut obj, "name", json!(name));
        set_meta(&mut obj, "resourceVersion", json!(rv));
        set_meta(&mut obj, "generation", json!(generation));
        state.unindex_owners(&slot, &current);
        state.index_owners(&slot, &obj);
        state.objects.insert(slot.clone(), obj.clone());
        drop(state);
        self.emit(&slot, StoreEventKind::Applied, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> StoreResult<bool> {
        let slot = Slot::new(ar, ns, name);
        let removed = {
            let mut state = self.lock()?;
            self.reap(&mut state, &slot)
        };
        if removed.len() > 1 {
            debug!(kind = %slot.kind, key = %slot.key, dependants = removed.len() - 1, "cascade delete");
        }
        let found = !removed.is_empty();
        for (s, obj) in removed {
            self.emit(&s, StoreEventKind::Deleted, obj);
        }
        Ok(found)
    }

    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, patch: Value) -> StoreResult<Value> {
        let slot = Slot::new(ar, ns, name);
        let mut state = self.lock()?;
        if state.fail_patches > 0 {
            state.fail_patches -= 1;
            return Err(StoreError::Backend(anyhow!("injected patch failure")));
        }
        let current = state.objects.get(&slot).cloned().ok_or_else(|| not_found(&slot))?;
        if let Some(expected) = resource_version_of(&patch) {
            let now = resource_version_of(&current).unwrap_or("");
            if expected != now {
                return Err(conflict(&slot, format!("resourceVersion {expected} is stale (now {now})")));
            }
        }
        let mut obj = current;
        if let Some(status) = patch.get("status") {
            let mut slot_status = obj.get("status").cloned().unwrap_or(Value::Null);
            merge::apply(&mut slot_status, status);
            match obj.as_object_mut() {
                Some(map) => {
                    map.insert("status".to_string(), slot_status);
                }
                None => return Err(StoreError::Invalid(format!("{} {} is not an object", slot.kind, slot.key))),
            }
        }
        let rv = state.next_version();
        set_meta(&mut obj, "resourceVersion", json!(rv));
        state.objects.insert(slot.clone(), obj.clone());
        state.patches.push(PatchRecord { kind: slot.kind.clone(), key: slot.key.clone(), patch });
        drop(state);
        self.emit(&slot, StoreEventKind::Applied, obj.clone());
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Kit, KitSpec};

    fn kit_ar() -> ApiResource { ApiResource::erase::<Kit>(&()) }

    fn raw(name: &str) -> Value {
        serde_json::to_value(Kit::new(name, KitSpec::default())).unwrap()
    }

    #[tokio::test]
    async fn create_stamps_metadata_and_drops_status() {
        let mb = MemoryBackend::new();
        let mut obj = raw("a");
        obj["status"] = json!({"phase": "Ready"});
        let created = mb.create(&kit_ar(), "ns", obj).await.unwrap();
        assert_eq!(created.pointer("/metadata/generation"), Some(&json!(1)));
        assert!(uid_of(&created).is_some());
        assert!(created.get("status").is_none());
        let again = mb.create(&kit_ar(), "ns", raw("a")).await.unwrap_err();
        assert!(again.is_already_exists());
    }

    #[tokio::test]
    async fn status_patch_checks_resource_version() {
        let mb = MemoryBackend::new();
        let created = mb.create(&kit_ar(), "ns", raw("a")).await.unwrap();
        let rv = resource_version_of(&created).unwrap().to_string();
        let ok = json!({"metadata": {"resourceVersion": rv}, "status": {"phase": "Initialization"}});
        mb.patch_status(&kit_ar(), "ns", "a", ok.clone()).await.unwrap();
        let err = mb.patch_status(&kit_ar(), "ns", "a", ok).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(mb.patch_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let mb = MemoryBackend::new();
        mb.create(&kit_ar(), "ns", raw("a")).await.unwrap();
        mb.fail_next_patches(1);
        let p = json!({"status": {"phase": "Error"}});
        assert!(mb.patch_status(&kit_ar(), "ns", "a", p.clone()).await.is_err());
        assert!(mb.patch_status(&kit_ar(), "ns", "a", p).await.is_ok());
    }
}
