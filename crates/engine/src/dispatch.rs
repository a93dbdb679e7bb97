//! Reconciler dispatcher: one pass = gates, one action, one status patch, events.

use std::time::{Duration, Instant};

use kiln_core::{Managed, ObjectKey};
use metrics::{counter, histogram};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::Pipeline;
use crate::patch::StatusPatcher;
use crate::{EngineError, Runtime};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Poll again after this long even without a watch event.
    pub requeue_after: Option<Duration>,
    /// Action that ran, if any.
    pub action: Option<&'static str>,
    /// Whether a status patch was written.
    pub patched: bool,
}

pub struct Dispatcher<K: Managed> {
    rt: Runtime,
    pipeline: Pipeline<K>,
    patcher: StatusPatcher,
}

impl<K: Managed> Dispatcher<K> {
    pub fn new(rt: Runtime, pipeline: Pipeline<K>) -> Self { Self { rt, pipeline, patcher: StatusPatcher } }

    pub fn runtime(&self) -> &Runtime { &self.rt }

    pub fn pipeline(&self) -> &Pipeline<K> { &self.pipeline }

    /// Run one bounded reconciliation pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, EngineError> {
        let kind = K::kind(&()).to_string();
        let span = info_span!("reconcile", kind = %kind, ns = %key.namespace, name = %key.name);
        let started = Instant::now();
        let timeout = self.rt.config.pass_timeout;
        let res = match tokio::time::timeout(timeout, self.pass(key)).instrument(span).await {
            Ok(res) => res,
            Err(_) => Err(EngineError::Timeout(timeout)),
        };
        let result = if res.is_ok() { "ok" } else { "error" };
        counter!("reconcile_total", 1u64, "kind" => kind.clone(), "result" => result);
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        res
    }

    async fn pass(&self, key: &ObjectKey) -> Result<Outcome, EngineError> {
        let store = &self.rt.store;
        let governance = &self.rt.governance;

        if !governance.allowed_on_namespace(store, &key.namespace).await? {
            info!("namespace locked by another operator, ignoring");
            return Ok(Outcome::default());
        }
        let Some(instance) = store.get::<K>(&key.namespace, &key.name).await? else {
            debug!("gone");
            return Ok(Outcome::default());
        };
        if !governance.is_handler_considering_lock(store, &key.namespace, &instance).await {
            info!("resource not assigned to this operator, ignoring");
            return Ok(Outcome::default());
        }

        let target = instance.clone();
        let Some(action) = self.pipeline.select(&target) else {
            return Ok(self.outcome(&instance, None, false));
        };
        debug!(action = action.name(), phase = %target.phase(), "invoking action");

        let cx = self.rt.context();
        let updated = match action.handle(&cx, target).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(action = action.name(), error = %e, "action failed");
                self.rt.notifier.error(&instance, &e.to_string()).await;
                return Err(e);
            }
        };
        let Some(mut updated) = updated else {
            return Ok(self.outcome(&instance, Some(action.name()), false));
        };

        let patched = match self.patcher.patch(store, &instance, &mut updated).await {
            Ok(patched) => patched,
            Err(e) => {
                warn!(action = action.name(), error = %e, "status patch failed");
                self.rt.notifier.error(&instance, &e.to_string()).await;
                return Err(e.into());
            }
        };
        if instance.phase() != updated.phase() {
            info!(action = action.name(), from = %instance.phase(), to = %updated.phase(), "state transition");
        }
        if patched {
            self.rt.notifier.updated(Some(&instance), &updated).await;
        }
        Ok(self.outcome(&updated, Some(action.name()), patched))
    }

    fn outcome(&self, current: &K, action: Option<&'static str>, patched: bool) -> Outcome {
        let requeue_after = self.pipeline.waits_in(current.phase()).then_some(self.rt.config.requeue_after);
        Outcome { requeue_after, action, patched }
    }
}
