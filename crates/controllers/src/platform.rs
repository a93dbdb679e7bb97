//! Platform state machine: validate the build settings and publish readiness.

use async_trait::async_trait;
use kiln_core::condition;
use kiln_core::{ConditionStatus, Managed, Platform, PlatformPhase};
use kiln_engine::{Action, ActionContext, EngineError};
use tracing::info;

pub const READY: &str = "Ready";

/// Problems that keep a platform from serving builds.
pub fn validate(platform: &Platform) -> Vec<String> {
    let mut problems = Vec::new();
    if platform.spec.registry.address.trim().is_empty() {
        problems.push("registry address is not set".to_string());
    }
    if platform.spec.build.max_running_builds == Some(0) {
        problems.push("maxRunningBuilds must be at least 1".to_string());
    }
    if platform.spec.build.timeout_seconds == Some(0) {
        problems.push("build timeout must be positive".to_string());
    }
    problems
}

fn apply_validation(platform: &mut Platform) {
    let problems = validate(platform);
    let status = platform.status_mut();
    if problems.is_empty() {
        condition::set(&mut status.conditions, READY, ConditionStatus::True, "PlatformReady", "platform is ready");
        status.phase = PlatformPhase::Ready;
    } else {
        condition::set(&mut status.conditions, READY, ConditionStatus::False, "InvalidSettings", problems.join("; "));
        status.phase = PlatformPhase::Error;
    }
}

pub struct PlatformInitialize;

#[async_trait]
impl Action<Platform> for PlatformInitialize {
    fn name(&self) -> &'static str { "initialize" }
    fn can_handle(&self, platform: &Platform) -> bool { platform.phase() == PlatformPhase::None }

    async fn handle(&self, _cx: &ActionContext<'_>, mut platform: Platform) -> Result<Option<Platform>, EngineError> {
        apply_validation(&mut platform);
        Ok(Some(platform))
    }
}

/// Re-validates a settled platform when its settings change.
pub struct PlatformMonitor;

#[async_trait]
impl Action<Platform> for PlatformMonitor {
    fn name(&self) -> &'static str { "monitor" }
    fn can_handle(&self, platform: &Platform) -> bool {
        matches!(platform.phase(), PlatformPhase::Ready | PlatformPhase::Error)
    }

    async fn handle(&self, _cx: &ActionContext<'_>, mut platform: Platform) -> Result<Option<Platform>, EngineError> {
        if platform.digest() == Some(platform.compute_digest().as_str()) {
            return Ok(None);
        }
        info!(from = %platform.phase(), "platform settings changed");
        apply_validation(&mut platform);
        Ok(Some(platform))
    }
}
