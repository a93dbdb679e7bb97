//! Namespace lock of a local operator: a Lease named `<operator-id>-lock`.
//!
//! Global operators without an operator id stay out of namespaces where this
//! lease exists (see the engine's governance gate).

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kiln_engine::OperatorConfig;
use kiln_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const LEASE_DURATION: Duration = Duration::from_secs(30);

pub struct LeaseKeeper {
    store: Store,
    namespace: String,
    name: String,
    holder: String,
}

impl LeaseKeeper {
    /// `None` for global operators: they hold no namespace.
    pub fn for_operator(store: Store, config: &OperatorConfig) -> Option<Self> {
        let namespace = config.watch_namespace.clone()?;
        let holder = config.pod_name.clone().unwrap_or_else(|| config.identity().to_string());
        Some(Self { store, namespace, name: OperatorConfig::lock_name(config.identity()), holder })
    }

    pub fn name(&self) -> &str { &self.name }

    fn compose(&self) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        }
    }

    /// Create the lease or bump its renew time.
    pub async fn renew(&self) -> Result<()> {
        match self.store.get::<Lease>(&self.namespace, &self.name).await? {
            None => {
                self.store.create(&self.compose()).await?;
                info!(ns = %self.namespace, lease = %self.name, "namespace lock acquired");
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                if spec.holder_identity.as_deref() != Some(self.holder.as_str()) {
                    debug!(previous = ?spec.holder_identity, "taking over namespace lock");
                    spec.holder_identity = Some(self.holder.clone());
                    spec.acquire_time = Some(MicroTime(Utc::now()));
                }
                spec.renew_time = Some(MicroTime(Utc::now()));
                self.store.replace(&lease).await?;
            }
        }
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        if self.store.delete::<Lease>(&self.namespace, &self.name).await? {
            info!(ns = %self.namespace, lease = %self.name, "namespace lock released");
        }
        Ok(())
    }

    /// Renew until cancelled, then release.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(LEASE_DURATION / 3);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.renew().await {
                        warn!(error = %e, lease = %self.name, "lease renewal failed");
                    }
                }
            }
        }
        if let Err(e) = self.release().await {
            warn!(error = %e, lease = %self.name, "lease release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: Option<&str>) -> OperatorConfig {
        OperatorConfig {
            operator_id: id.map(str::to_string),
            watch_namespace: Some("team".into()),
            pod_name: Some("kiln-0".into()),
            ..Default::default()
        }
    }

    #[test]
    fn global_operators_hold_no_lease() {
        let (store, _) = Store::memory();
        assert!(LeaseKeeper::for_operator(store, &OperatorConfig::default()).is_none());
    }

    #[tokio::test]
    async fn renew_creates_then_updates_the_lease() {
        let (store, _) = Store::memory();
        let keeper = LeaseKeeper::for_operator(store.clone(), &local(Some("blue"))).unwrap();
        assert_eq!(keeper.name(), "blue-lock");

        keeper.renew().await.unwrap();
        let first = store.get::<Lease>("team", "blue-lock").await.unwrap().unwrap();
        let spec = first.spec.clone().unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("kiln-0"));

        keeper.renew().await.unwrap();
        let second = store.get::<Lease>("team", "blue-lock").await.unwrap().unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);
    }

    #[tokio::test]
    async fn run_releases_on_cancel() {
        let (store, _) = Store::memory();
        let keeper = LeaseKeeper::for_operator(store.clone(), &local(None)).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keeper.run(cancel.clone()));
        for _ in 0..50 {
            if store.get::<Lease>("team", "kiln-lock").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get::<Lease>("team", "kiln-lock").await.unwrap().is_some());
        cancel.cancel();
        task.await.unwrap();
        assert!(store.get::<Lease>("team", "kiln-lock").await.unwrap().is_none());
    }
}
