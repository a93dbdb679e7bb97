//! Kit state machine.
//!
//! ```text
//! None/WaitingForPlatform -> Initialization -> BuildSubmitted -> BuildRunning -> Ready | Error
//!                                          \-> Ready (literal image)  \-> CannotBuild
//! Ready | Error | CannotBuild --(digest changed)--> Initialization
//! ```

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::condition;
use kiln_core::{pin_image, Artifact, Build, BuildPhase, BuildSpec, ConditionStatus, Failure, Kit, KitPhase, Managed};
use kiln_engine::{Action, ActionContext, EngineError, InconsistentPhasePolicy, Resolution, ResolvedPlatform};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::env::{Environment, EnvironmentResolver};

pub const CATALOG_AVAILABLE: &str = "CatalogAvailable";

async fn resolved_platform(cx: &ActionContext<'_>, kit: &Kit) -> Result<ResolvedPlatform, EngineError> {
    let explicit = kit
        .status
        .as_ref()
        .and_then(|s| s.platform.clone())
        .or_else(|| kit.spec.platform.clone());
    match cx.platforms.resolve(cx.store, kit, explicit.as_deref()).await? {
        Resolution::Ready(p) => Ok(*p),
        Resolution::Waiting(reason) => Err(anyhow!("kit {}: {}", kit.name_any(), reason).into()),
    }
}

fn owned_by(build: &Build, kit: &Kit) -> bool {
    match kit.uid() {
        Some(uid) => build.owner_references().iter().any(|o| o.uid == uid),
        None => false,
    }
}

/// Resolves the build environment and decides how the kit gets its image.
pub struct KitInitialize {
    resolver: Arc<dyn EnvironmentResolver>,
}

impl KitInitialize {
    pub fn new(resolver: Arc<dyn EnvironmentResolver>) -> Self { Self { resolver } }
}

#[async_trait]
impl Action<Kit> for KitInitialize {
    fn name(&self) -> &'static str { "initialize" }
    fn can_handle(&self, kit: &Kit) -> bool { kit.phase() == KitPhase::Initialization }

    async fn handle(&self, cx: &ActionContext<'_>, mut kit: Kit) -> Result<Option<Kit>, EngineError> {
        let platform = resolved_platform(cx, &kit).await?;
        let env = self.resolver.resolve(&kit, &platform).await?;
        let literal = kit.literal_image().map(str::to_string);

        let status = kit.status_mut();
        status.runtime_version = env.runtime_version.clone();
        status.failure = None;

        if let Some(image) = literal {
            status.image = Some(image);
            status.base_image = None;
            status.artifacts.clear();
            status.phase = KitPhase::Ready;
            return Ok(Some(kit));
        }

        match &env.catalog {
            Some(catalog) => {
                condition::set(
                    &mut status.conditions,
                    CATALOG_AVAILABLE,
                    ConditionStatus::True,
                    "CatalogAvailable",
                    format!("runtime {}", catalog.runtime_version),
                );
                status.phase = KitPhase::BuildSubmitted;
            }
            None => {
                condition::set(
                    &mut status.conditions,
                    CATALOG_AVAILABLE,
                    ConditionStatus::False,
                    "NoCatalog",
                    format!("no catalog available on platform {}", platform.name()),
                );
                status.phase = KitPhase::CannotBuild;
            }
        }
        Ok(Some(kit))
    }
}

/// Makes sure a build for the current digest exists.
pub struct KitBuildSubmit {
    resolver: Arc<dyn EnvironmentResolver>,
}

impl KitBuildSubmit {
    pub fn new(resolver: Arc<dyn EnvironmentResolver>) -> Self { Self { resolver } }

    fn compose(
        &self,
        cx: &ActionContext<'_>,
        kit: &Kit,
        platform: &ResolvedPlatform,
        env: Environment,
        name: &str,
        digest: &str,
    ) -> Result<Build, EngineError> {
        let owner = kit
            .controller_owner_ref(&())
            .ok_or_else(|| anyhow!("kit {} has no uid", kit.name_any()))?;
        let ns = kit.namespace().unwrap_or_default();
        let snapshot = platform.snapshot();
        let image = format!("{}/{}/kiln-kit-{}:{}", snapshot.registry, ns, kit.name_any(), digest);
        let mut build = Build::new(
            name,
            BuildSpec {
                dependencies: env.dependencies,
                runtime_version: env.runtime_version,
                build_dir: kit.spec.build_dir.clone(),
                image,
                base_image: snapshot.base_image.clone(),
                steps: env.steps,
                timeout_seconds: platform.build.timeout().as_secs(),
                kit_digest: digest.to_string(),
                platform: snapshot,
            },
        );
        build.metadata.namespace = Some(ns);
        build.metadata.owner_references = Some(vec![owner]);
        let labels = build.labels_mut();
        labels.insert(cx.vocabulary.kit_label(), kit.name_any());
        labels.extend(cx.vocabulary.creator_labels(kit));
        let annotations = build.annotations_mut();
        annotations.insert(cx.vocabulary.platform_selector(), platform.name());
        if let Some(id) = cx.vocabulary.operator_id_of(kit) {
            annotations.insert(cx.vocabulary.operator_id(), id.to_string());
        }
        Ok(build)
    }
}

#[async_trait]
impl Action<Kit> for KitBuildSubmit {
    fn name(&self) -> &'static str { "build-submit" }
    fn can_handle(&self, kit: &Kit) -> bool { kit.phase() == KitPhase::BuildSubmitted }

    async fn handle(&self, cx: &ActionContext<'_>, mut kit: Kit) -> Result<Option<Kit>, EngineError> {
        let ns = kit.namespace().unwrap_or_default();
        let digest = kit.compute_digest();
        let existing = cx
            .store
            .get::<Build>(&ns, &kit.build_name())
            .await?
            .filter(|b| owned_by(b, &kit));

        if let Some(build) = &existing {
            if build.spec.kit_digest == digest {
                let phase = build.phase();
                if phase == BuildPhase::Running || phase.is_terminal() {
                    kit.set_phase(KitPhase::BuildRunning);
                    return Ok(Some(kit));
                }
                debug!(build = %build.name_any(), phase = %phase, "waiting for build to start");
                return Ok(None);
            }
        }

        let platform = resolved_platform(cx, &kit).await?;
        let env = self.resolver.resolve(&kit, &platform).await?;
        if env.catalog.is_none() {
            return Err(anyhow!("no catalog available for kit {}", kit.name_any()).into());
        }

        if let Some(stale) = &existing {
            info!(build = %stale.name_any(), "deleting stale build");
            cx.store.delete::<Build>(&ns, &stale.name_any()).await?;
        }
        let sequence = kit.status.as_ref().map(|s| s.build_sequence).unwrap_or(0) + 1;
        let name = if sequence == 1 { kit.name_any() } else { format!("{}-{}", kit.name_any(), sequence) };
        if let Some(squatter) = cx.store.get::<Build>(&ns, &name).await? {
            if !owned_by(&squatter, &kit) {
                return Err(anyhow!("build {name} exists and is not owned by kit {}", kit.name_any()).into());
            }
            cx.store.delete::<Build>(&ns, &name).await?;
        }

        let build = self.compose(cx, &kit, &platform, env, &name, &digest)?;
        cx.store.create(&build).await?;
        info!(build = %name, digest = %digest, "build submitted");

        let status = kit.status_mut();
        status.build = Some(name);
        status.build_sequence = sequence;
        Ok(Some(kit))
    }
}

/// Follows the owned build until it completes.
pub struct KitBuildPoll;

impl KitBuildPoll {
    /// Re-read the kit: a completed build only applies to a kit still waiting on it.
    async fn still_waiting(&self, cx: &ActionContext<'_>, kit: &Kit) -> Result<bool, EngineError> {
        let ns = kit.namespace().unwrap_or_default();
        let found = match cx.store.get::<Kit>(&ns, &kit.name_any()).await? {
            Some(fresh) => fresh.phase(),
            None => return Ok(false),
        };
        if found == KitPhase::BuildRunning {
            return Ok(true);
        }
        match cx.config.inconsistent_phase {
            InconsistentPhasePolicy::Fail => Err(EngineError::InconsistentPhase {
                kind: "Kit".into(),
                name: kit.name_any(),
                expected: KitPhase::BuildRunning.to_string(),
                found: found.to_string(),
            }),
            InconsistentPhasePolicy::Resync => {
                warn!(found = %found, "kit moved on while its build completed, resyncing");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Action<Kit> for KitBuildPoll {
    fn name(&self) -> &'static str { "build-poll" }
    fn can_handle(&self, kit: &Kit) -> bool { kit.phase() == KitPhase::BuildRunning }

    async fn handle(&self, cx: &ActionContext<'_>, mut kit: Kit) -> Result<Option<Kit>, EngineError> {
        let ns = kit.namespace().unwrap_or_default();
        let name = kit.build_name();
        let Some(build) = cx.store.get::<Build>(&ns, &name).await? else {
            let status = kit.status_mut();
            status.failure = Some(Failure { reason: format!("build {name} not found"), time: Some(Utc::now()), ..Default::default() });
            status.phase = KitPhase::Error;
            return Ok(Some(kit));
        };
        if build.spec.kit_digest != kit.compute_digest() {
            info!(build = %name, "kit changed while building");
            kit.set_phase(KitPhase::Initialization);
            return Ok(Some(kit));
        }

        match build.phase() {
            BuildPhase::Succeeded => {
                if !self.still_waiting(cx, &kit).await? {
                    return Ok(None);
                }
                let result = build.status.clone().unwrap_or_default();
                let image = result.image.clone().unwrap_or_else(|| build.spec.image.clone());
                let status = kit.status_mut();
                status.image = Some(match &result.image_digest {
                    Some(d) => pin_image(&image, d),
                    None => image,
                });
                status.base_image = result.base_image.or_else(|| Some(build.spec.base_image.clone()));
                status.artifacts = result
                    .artifacts
                    .into_iter()
                    .map(|a| Artifact { location: None, ..a })
                    .collect();
                status.failure = None;
                status.phase = KitPhase::Ready;
                Ok(Some(kit))
            }
            BuildPhase::Error | BuildPhase::Interrupted => {
                if !self.still_waiting(cx, &kit).await? {
                    return Ok(None);
                }
                let result = build.status.clone().unwrap_or_default();
                let failure = result.failure.unwrap_or_else(|| Failure {
                    reason: result.error.unwrap_or_else(|| format!("build {name} {}", build.phase())),
                    time: Some(Utc::now()),
                    ..Default::default()
                });
                let status = kit.status_mut();
                status.failure = Some(failure);
                status.phase = KitPhase::Error;
                Ok(Some(kit))
            }
            phase => {
                debug!(build = %name, phase = %phase, "build in progress");
                Ok(None)
            }
        }
    }
}

/// Sends a ready kit back to initialization when its spec drifts.
pub struct KitMonitor;

#[async_trait]
impl Action<Kit> for KitMonitor {
    fn name(&self) -> &'static str { "monitor" }
    fn can_handle(&self, kit: &Kit) -> bool { kit.phase() == KitPhase::Ready }

    async fn handle(&self, _cx: &ActionContext<'_>, mut kit: Kit) -> Result<Option<Kit>, EngineError> {
        let digest = kit.compute_digest();
        let drifted = kit.digest() != Some(digest.as_str());
        let stored = kit.status.as_ref().and_then(|s| s.image.as_deref());
        let image_changed = matches!(kit.literal_image(), Some(declared) if stored != Some(declared));
        if !drifted && !image_changed {
            return Ok(None);
        }
        info!(drifted, image_changed, "kit changed, rebuilding");
        kit.set_phase(KitPhase::Initialization);
        Ok(Some(kit))
    }
}

/// Retries a failed kit once its spec changes.
pub struct KitErrorRecovery;

#[async_trait]
impl Action<Kit> for KitErrorRecovery {
    fn name(&self) -> &'static str { "error-recovery" }
    fn can_handle(&self, kit: &Kit) -> bool { matches!(kit.phase(), KitPhase::Error | KitPhase::CannotBuild) }

    async fn handle(&self, _cx: &ActionContext<'_>, mut kit: Kit) -> Result<Option<Kit>, EngineError> {
        if kit.digest() == Some(kit.compute_digest().as_str()) {
            return Ok(None);
        }
        info!(from = %kit.phase(), "kit changed, retrying");
        let status = kit.status_mut();
        status.failure = None;
        status.phase = KitPhase::Initialization;
        Ok(Some(kit))
    }
}
