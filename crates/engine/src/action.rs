//! Actions and the ordered pipelines that hold them.

use async_trait::async_trait;
use kiln_core::{Managed, PhaseOf, Vocabulary};
use kiln_store::Store;

use crate::config::{EngineConfig, OperatorConfig};
use crate::platform::PlatformResolver;
use crate::EngineError;

/// Everything an action may consult while handling a resource.
pub struct ActionContext<'a> {
    pub store: &'a Store,
    pub config: &'a EngineConfig,
    pub operator: &'a OperatorConfig,
    pub vocabulary: &'a Vocabulary,
    pub platforms: &'a PlatformResolver,
}

/// One policy step of a resource's state machine.
///
/// Actions are stateless with respect to the resource: everything they know
/// comes from `target` and the store. Returning `Ok(Some(updated))` asks the
/// dispatcher to persist `updated`'s status; `Ok(None)` means nothing to do.
#[async_trait]
pub trait Action<K: Managed>: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, target: &K) -> bool;
    async fn handle(&self, cx: &ActionContext<'_>, target: K) -> Result<Option<K>, EngineError>;
}

/// Ordered actions of one kind; the first that can handle a resource wins.
pub struct Pipeline<K: Managed> {
    actions: Vec<Box<dyn Action<K>>>,
    waiting: Vec<PhaseOf<K>>,
}

impl<K: Managed> Default for Pipeline<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Managed> Pipeline<K> {
    pub fn new() -> Self { Self { actions: Vec::new(), waiting: Vec::new() } }

    pub fn then(mut self, action: impl Action<K> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Phases that wait on something outside the resource and are polled at a fixed interval.
    pub fn requeue_while(mut self, phases: &[PhaseOf<K>]) -> Self {
        self.waiting.extend_from_slice(phases);
        self
    }

    pub fn select(&self, target: &K) -> Option<&dyn Action<K>> {
        self.actions.iter().find(|a| a.can_handle(target)).map(|a| a.as_ref())
    }

    pub fn waits_in(&self, phase: PhaseOf<K>) -> bool { self.waiting.contains(&phase) }

    pub fn len(&self) -> usize { self.actions.len() }
    pub fn is_empty(&self) -> bool { self.actions.is_empty() }
}
