//! Which operator owns which namespace and resource.
//!
//! Several operators may share a cluster. A global operator without an id
//! backs off from namespaces locked by a local operator (a Lease named after
//! a primary platform of the namespace); resources are claimed through the
//! operator id annotation.

use std::sync::Arc;

use k8s_openapi::api::coordination::v1::Lease;
use kiln_core::{Vocabulary, DEFAULT_PLATFORM_NAME};
use kiln_store::{Store, StoreResult};
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::config::OperatorConfig;
use crate::platform::PlatformResolver;

#[derive(Clone)]
pub struct Governance {
    config: Arc<OperatorConfig>,
    vocabulary: Arc<Vocabulary>,
    platforms: PlatformResolver,
}

impl Governance {
    pub fn new(config: Arc<OperatorConfig>, vocabulary: Arc<Vocabulary>, platforms: PlatformResolver) -> Self {
        Self { config, vocabulary, platforms }
    }

    /// A namespace is locked when the lease of any of its primary platforms exists.
    pub async fn is_namespace_locked(&self, store: &Store, ns: &str) -> StoreResult<bool> {
        if ns.is_empty() {
            return Ok(false);
        }
        for platform in self.platforms.list_primary(store, ns).await? {
            let name = OperatorConfig::lock_name(&platform.name_any());
            if store.get::<Lease>(ns, &name).await?.is_some() {
                debug!(ns = %ns, lease = %name, "namespace locked");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn allowed_on_namespace(&self, store: &Store, ns: &str) -> StoreResult<bool> {
        if !self.config.is_global() {
            return Ok(true);
        }
        if self.config.operator_id().is_some() {
            return Ok(true);
        }
        if self.config.operator_namespace.as_deref() == Some(ns) {
            return Ok(true);
        }
        Ok(!self.is_namespace_locked(store, ns).await?)
    }

    pub fn is_handler<K: Resource>(&self, obj: &K) -> bool {
        let resource_id = self.vocabulary.operator_id_of(obj);
        let operator_id = self.config.operator_id();
        if resource_id == operator_id {
            return true;
        }
        // unannotated resources
        resource_id.is_none() && (operator_id == Some(DEFAULT_PLATFORM_NAME) || !self.config.is_global())
    }

    /// `is_handler`, plus: in a locked namespace local operators take unannotated resources.
    pub async fn is_handler_considering_lock<K: Resource>(&self, store: &Store, ns: &str, obj: &K) -> bool {
        if !self.is_handler(obj) {
            return false;
        }
        if self.vocabulary.operator_id_of(obj).is_some() {
            return true;
        }
        if self.config.operator_namespace.as_deref() == Some(ns) {
            return true;
        }
        match self.is_namespace_locked(store, ns).await {
            Ok(false) => true,
            _ => !self.config.is_global(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Kit, KitSpec};

    fn governance(cfg: OperatorConfig) -> Governance {
        let cfg = Arc::new(cfg);
        let vocab = Arc::new(Vocabulary::default());
        Governance::new(cfg.clone(), vocab.clone(), PlatformResolver::new(cfg, vocab))
    }

    fn kit(id: Option<&str>) -> Kit {
        let mut k = Kit::new("k", KitSpec::default());
        if let Some(id) = id {
            k.annotations_mut().insert("kiln.dev/operator.id".into(), id.into());
        }
        k
    }

    #[test]
    fn matching_ids_are_handled() {
        let g = governance(OperatorConfig { operator_id: Some("a".into()), ..Default::default() });
        assert!(g.is_handler(&kit(Some("a"))));
        assert!(!g.is_handler(&kit(Some("b"))));
        assert!(!g.is_handler(&kit(None)));
    }

    #[test]
    fn default_and_local_operators_take_unannotated() {
        let default_global = governance(OperatorConfig { operator_id: Some("kiln".into()), ..Default::default() });
        assert!(default_global.is_handler(&kit(None)));
        let local = governance(OperatorConfig {
            operator_id: Some("x".into()),
            watch_namespace: Some("ns".into()),
            ..Default::default()
        });
        assert!(local.is_handler(&kit(None)));
        let anonymous = governance(OperatorConfig::default());
        assert!(anonymous.is_handler(&kit(None)));
        assert!(!anonymous.is_handler(&kit(Some("kiln"))));
    }
}
