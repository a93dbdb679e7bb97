//! Event notifier: phase, condition and error events for reconciled resources.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kiln_core::{Condition, Managed, Vocabulary};
use kube::{Resource, ResourceExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub reason: String,
    pub action: String,
    pub note: String,
}

/// Where events go. Publishing is fire-and-forget: sinks log their own failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, event: EventRecord);
}

/// Sink keeping everything in memory.
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<(ObjectReference, EventRecord)>>,
}

impl MemoryEvents {
    pub fn new() -> Self { Self::default() }

    pub fn recorded(&self) -> Vec<(ObjectReference, EventRecord)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.recorded().into_iter().map(|(_, e)| e.reason).collect()
    }

    /// Events recorded against the named object.
    pub fn about(&self, kind: &str, name: &str) -> Vec<EventRecord> {
        self.recorded()
            .into_iter()
            .filter(|(r, _)| r.kind.as_deref() == Some(kind) && r.name.as_deref() == Some(name))
            .map(|(_, e)| e)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn publish(&self, regarding: &ObjectReference, event: EventRecord) {
        if let Ok(mut e) = self.events.lock() {
            e.push((regarding.clone(), event));
        }
    }
}

pub const RELATED_OBJECT_CHANGED: &str = "RelatedObjectChanged";
const ACTION: &str = "Reconcile";

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
    vocabulary: Arc<Vocabulary>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>, vocabulary: Arc<Vocabulary>) -> Self { Self { sink, vocabulary } }

    async fn emit(&self, regarding: &ObjectReference, kind: EventKind, reason: String, note: String) {
        debug!(reason = %reason, name = ?regarding.name, "event");
        self.sink.publish(regarding, EventRecord { kind, reason, action: ACTION.to_string(), note }).await;
    }

    /// Warning against `res` for a failed action or patch.
    pub async fn error<K: Managed>(&self, res: &K, err: &str) {
        let kind = K::kind(&());
        let note = format!("Cannot reconcile {} {}: {}", kind, res.name_any(), err);
        self.emit(&res.object_ref(&()), EventKind::Warning, format!("{kind}Error"), note).await;
    }

    /// Phase and condition events for the change `old -> new`.
    pub async fn updated<K: Managed>(&self, old: Option<&K>, new: &K) {
        let kind = K::kind(&());
        let name = new.name_any();
        let regarding = new.object_ref(&());
        let old_phase = old.map(|o| o.phase()).unwrap_or_default();
        let new_phase = new.phase();

        if old_phase != new_phase {
            let mut note = format!("{kind} \"{name}\" in phase \"{new_phase}\"");
            if let Some(extra) = new.phase_note() {
                note.push(' ');
                note.push_str(&extra);
            }
            self.emit(&regarding, EventKind::Normal, format!("{kind}PhaseUpdated"), note.clone()).await;
            if let Some(owner) = self.owner_of(new) {
                self.emit(&owner, EventKind::Normal, RELATED_OBJECT_CHANGED.to_string(), note).await;
            }
        }

        if new_phase == Default::default() {
            return;
        }
        let old_conditions = old.map(|o| o.conditions()).unwrap_or(&[]);
        for c in changed_conditions(old_conditions, new.conditions()) {
            let mut note = format!("Condition \"{}\" is \"{}\"", c.type_, c.status.as_str());
            if !c.reason.is_empty() {
                note.push_str(&format!(" for {}: {}", kind, c.reason));
            }
            if !c.message.is_empty() {
                note.push_str(&format!(": {}", c.message));
            }
            self.emit(&regarding, EventKind::Normal, format!("{kind}ConditionChanged"), note).await;
        }
    }

    /// Controller owner reference, else the creator labels.
    fn owner_of<K: Resource>(&self, res: &K) -> Option<ObjectReference> {
        let ns = res.namespace();
        if let Some(owner) = res.owner_references().iter().find(|o| o.controller == Some(true)) {
            return Some(ObjectReference {
                api_version: Some(owner.api_version.clone()),
                kind: Some(owner.kind.clone()),
                name: Some(owner.name.clone()),
                namespace: ns,
                uid: Some(owner.uid.clone()),
                ..Default::default()
            });
        }
        let labels = res.labels();
        let kind = labels.get(&self.vocabulary.created_by_kind())?;
        let name = labels.get(&self.vocabulary.created_by_name())?;
        Some(ObjectReference {
            api_version: labels.get(&self.vocabulary.created_by_version()).cloned(),
            kind: Some(kind.clone()),
            name: Some(name.clone()),
            namespace: labels.get(&self.vocabulary.created_by_namespace()).cloned().or(ns),
            ..Default::default()
        })
    }
}

/// Conditions of `new` that are new or whose status or message changed.
fn changed_conditions<'a>(old: &[Condition], new: &'a [Condition]) -> Vec<&'a Condition> {
    new.iter()
        .filter(|c| match kiln_core::condition::find(old, &c.type_) {
            Some(o) => o.status != c.status || o.message != c.message,
            None => true,
        })
        .collect()
}
