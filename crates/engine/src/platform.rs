//! Platform lookup: which platform (and profile) applies to a resource, and is it ready.

use std::sync::Arc;

use kiln_core::{Platform, PlatformBuildSpec, PlatformSnapshot, Profile, Vocabulary};
use kiln_store::{Store, StoreResult};
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::config::OperatorConfig;

/// A ready platform with its profile overlay applied.
#[derive(Debug, Clone)]
pub struct ResolvedPlatform {
    pub platform: Platform,
    pub profile: Option<Profile>,
    /// Effective build settings: platform overlaid by profile.
    pub build: PlatformBuildSpec,
}

impl ResolvedPlatform {
    pub fn new(platform: Platform, profile: Option<Profile>) -> Self {
        let build = match &profile {
            Some(p) => platform.spec.build.overlay(&p.spec.build),
            None => platform.spec.build.clone(),
        };
        Self { platform, profile, build }
    }

    pub fn name(&self) -> String { self.platform.name_any() }

    pub fn registry(&self) -> &str { self.platform.spec.registry.address.trim_end_matches('/') }

    pub fn snapshot(&self) -> PlatformSnapshot {
        PlatformSnapshot {
            name: self.name(),
            registry: self.registry().to_string(),
            insecure: self.platform.spec.registry.insecure,
            base_image: self.build.base_image_or_default().to_string(),
            builder_image: self.build.builder_image_or_default().to_string(),
            max_running_builds: self.build.max_running_builds_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Ready(Box<ResolvedPlatform>),
    /// Not usable yet; the reason ends up in a condition message.
    Waiting(String),
}

#[derive(Clone)]
pub struct PlatformResolver {
    config: Arc<OperatorConfig>,
    vocabulary: Arc<Vocabulary>,
}

impl PlatformResolver {
    pub fn new(config: Arc<OperatorConfig>, vocabulary: Arc<Vocabulary>) -> Self { Self { config, vocabulary } }

    /// Named platform in `ns`, falling back to the operator namespace.
    pub async fn get(&self, store: &Store, ns: &str, name: &str) -> StoreResult<Option<Platform>> {
        if let Some(p) = store.get::<Platform>(ns, name).await? {
            return Ok(Some(p));
        }
        match self.config.operator_namespace.as_deref() {
            Some(op_ns) if op_ns != ns => store.get::<Platform>(op_ns, name).await,
            _ => Ok(None),
        }
    }

    /// Platforms in `ns` not marked secondary.
    pub async fn list_primary(&self, store: &Store, ns: &str) -> StoreResult<Vec<Platform>> {
        let all = store.list::<Platform>(Some(ns)).await?;
        Ok(all.into_iter().filter(|p| !self.vocabulary.is_secondary(p)).collect())
    }

    /// First primary platform of the namespace, preferring a ready one.
    pub async fn find_local(&self, store: &Store, ns: &str) -> StoreResult<Option<Platform>> {
        let mut primary = self.list_primary(store, ns).await?;
        if let Some(i) = primary.iter().position(Platform::is_ready) {
            return Ok(Some(primary.swap_remove(i)));
        }
        Ok(primary.into_iter().next())
    }

    pub async fn find_profile(&self, store: &Store, ns: &str, name: &str) -> StoreResult<Option<Profile>> {
        if let Some(p) = store.get::<Profile>(ns, name).await? {
            return Ok(Some(p));
        }
        match self.config.operator_namespace.as_deref() {
            Some(op_ns) if op_ns != ns => store.get::<Profile>(op_ns, name).await,
            _ => Ok(None),
        }
    }

    /// Resolve the platform for `obj`. `explicit` wins over the selector annotation.
    pub async fn resolve<K: Resource>(&self, store: &Store, obj: &K, explicit: Option<&str>) -> StoreResult<Resolution> {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let selected = explicit.filter(|s| !s.is_empty()).or_else(|| self.vocabulary.platform_of(obj));
        let platform = match selected {
            Some(name) => self.get(store, &ns, name).await?,
            None => self.find_local(store, &ns).await?,
        };
        let Some(platform) = platform else {
            let reason = match selected {
                Some(name) => format!("platform {name} not found"),
                None => format!("no platform found in namespace {ns}"),
            };
            debug!(ns = %ns, reason = %reason, "platform unresolved");
            return Ok(Resolution::Waiting(reason));
        };
        if !platform.is_ready() {
            return Ok(Resolution::Waiting(format!("platform {} is not ready", platform.name_any())));
        }
        let profile = match self.vocabulary.profile_of(obj) {
            Some(name) => match self.find_profile(store, &ns, name).await? {
                Some(p) => Some(p),
                None => return Ok(Resolution::Waiting(format!("profile {name} not found"))),
            },
            None => None,
        };
        Ok(Resolution::Ready(Box::new(ResolvedPlatform::new(platform, profile))))
    }
}
