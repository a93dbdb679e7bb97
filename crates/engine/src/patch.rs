//! Status patcher: persists the result of one action as a merge patch of `status`.

use kiln_core::Managed;
use kiln_store::{merge, Store, StoreError};
use kube::ResourceExt;
use serde_json::json;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusPatcher;

impl StatusPatcher {
    /// Stamp digest and observed generation on `target`, then patch the status
    /// difference against `base` (the snapshot the pass started from).
    ///
    /// Returns `false` when there was nothing to write. On success `target` is
    /// replaced by the stored object.
    pub async fn patch<K: Managed>(&self, store: &Store, base: &K, target: &mut K) -> Result<bool, StoreError> {
        target.set_digest(target.compute_digest());
        target.set_observed_generation(base.meta().generation);

        let before = base.status_value()?;
        let after = target.status_value()?;
        let Some(status) = merge::diff(&before, &after) else {
            trace!(name = %base.name_any(), "status unchanged");
            return Ok(false);
        };
        let mut patch = json!({ "status": status });
        if let Some(rv) = base.meta().resource_version.as_deref() {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let ns = base.namespace().unwrap_or_default();
        *target = store.patch_status::<K>(&ns, &base.name_any(), patch).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Kit, KitPhase, KitSpec};

    async fn stored_kit(store: &Store) -> Kit {
        let mut k = Kit::new("k", KitSpec { dependencies: vec!["camel:timer".into()], ..Default::default() });
        k.metadata.namespace = Some("ns".into());
        store.create(&k).await.unwrap()
    }

    #[tokio::test]
    async fn writes_digest_and_generation() {
        let (store, mem) = Store::memory();
        let base = stored_kit(&store).await;
        let mut target = base.clone();
        target.set_phase(KitPhase::Initialization);
        assert!(StatusPatcher.patch(&store, &base, &mut target).await.unwrap());
        let status = target.status.clone().unwrap();
        assert_eq!(status.phase, KitPhase::Initialization);
        assert_eq!(status.digest, Some(base.compute_digest()));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(mem.patch_count(), 1);
    }

    #[tokio::test]
    async fn skips_empty_diff() {
        let (store, mem) = Store::memory();
        let base = stored_kit(&store).await;
        let mut first = base.clone();
        first.set_phase(KitPhase::Ready);
        StatusPatcher.patch(&store, &base, &mut first).await.unwrap();

        let mut again = first.clone();
        assert!(!StatusPatcher.patch(&store, &first, &mut again).await.unwrap());
        assert_eq!(mem.patch_count(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_conflicts() {
        let (store, _) = Store::memory();
        let base = stored_kit(&store).await;
        let mut a = base.clone();
        a.set_phase(KitPhase::Initialization);
        StatusPatcher.patch(&store, &base, &mut a).await.unwrap();

        let mut b = base.clone();
        b.set_phase(KitPhase::Error);
        let err = StatusPatcher.patch(&store, &base, &mut b).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
