//! Event sink publishing `events.k8s.io` events through kube's recorder.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kiln_engine::{EventKind, EventRecord, EventSink};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use metrics::counter;
use tracing::warn;

pub const CONTROLLER_NAME: &str = "kiln-operator";

pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: CONTROLLER_NAME.into(), instance } }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, regarding: &ObjectReference, record: EventRecord) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let type_ = match record.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let event = Event { type_, reason: record.reason.clone(), note: Some(record.note), action: record.action, secondary: None };
        if let Err(e) = recorder.publish(event).await {
            counter!("events_dropped_total", 1u64);
            warn!(reason = %record.reason, name = ?regarding.name, error = %e, "failed to publish event");
        }
    }
}
