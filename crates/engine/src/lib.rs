//! kiln engine: the generic reconciliation loop shared by every kind.
//!
//! A pass fetches one resource, applies the governance gates, runs the first
//! action of the kind's pipeline that accepts it, merge-patches the resulting
//! status and publishes events. Work queues and worker pools drive passes.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_core::Vocabulary;
use kiln_store::{Store, StoreError};

pub mod action;
pub mod config;
pub mod dispatch;
pub mod governance;
pub mod notify;
pub mod patch;
pub mod platform;
pub mod queue;

pub use action::{Action, ActionContext, Pipeline};
pub use config::{EngineConfig, InconsistentPhasePolicy, OperatorConfig};
pub use dispatch::{Dispatcher, Outcome};
pub use governance::Governance;
pub use notify::{EventKind, EventRecord, EventSink, MemoryEvents, Notifier};
pub use patch::StatusPatcher;
pub use platform::{PlatformResolver, Resolution, ResolvedPlatform};
pub use queue::{spawn_workers, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("found {kind} {name} not in the expected phase (expected={expected}, found={found})")]
    InconsistentPhase { kind: String, name: String, expected: String, found: String },
    #[error("{0:#}")]
    Collaborator(#[from] anyhow::Error),
    #[error("reconcile pass timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared collaborators of every dispatcher in the process.
#[derive(Clone)]
pub struct Runtime {
    pub store: Store,
    pub operator: Arc<OperatorConfig>,
    pub config: Arc<EngineConfig>,
    pub vocabulary: Arc<Vocabulary>,
    pub platforms: PlatformResolver,
    pub governance: Governance,
    pub notifier: Notifier,
}

impl Runtime {
    pub fn new(
        store: Store,
        operator: OperatorConfig,
        config: EngineConfig,
        vocabulary: Vocabulary,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let operator = Arc::new(operator);
        let vocabulary = Arc::new(vocabulary);
        let platforms = PlatformResolver::new(operator.clone(), vocabulary.clone());
        let governance = Governance::new(operator.clone(), vocabulary.clone(), platforms.clone());
        let notifier = Notifier::new(events, vocabulary.clone());
        Self { store, operator, config: Arc::new(config), vocabulary, platforms, governance, notifier }
    }

    pub fn context(&self) -> ActionContext<'_> {
        ActionContext {
            store: &self.store,
            config: &self.config,
            operator: &self.operator,
            vocabulary: &self.vocabulary,
            platforms: &self.platforms,
        }
    }
}
