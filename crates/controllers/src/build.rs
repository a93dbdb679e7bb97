//! Build state machine: scheduling, monitoring and bounded recovery of one-shot builds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{Build, BuildPhase, Failure, Managed, Recovery};
use kiln_engine::{Action, ActionContext, EngineError};
use kube::ResourceExt;
use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::runner::{BuildRunner, RunState};

fn elapsed_since(started: Option<DateTime<Utc>>) -> Option<String> {
    let started = started?;
    let secs = (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
    Some(format!("{secs:.1}s"))
}

/// Record a failure, keeping the recovery progress of earlier ones.
fn fail(build: &mut Build, reason: String, attempt_max: u32) {
    let status = build.status_mut();
    let recovery = status.failure.take().map(|f| f.recovery).unwrap_or_default();
    status.failure = Some(Failure {
        reason: reason.clone(),
        time: Some(Utc::now()),
        recovery: Recovery { attempt_max, ..recovery },
    });
    status.error = Some(reason);
    status.duration = elapsed_since(status.started_at);
    status.phase = BuildPhase::Failed;
}

/// Clears the results of a previous attempt.
pub struct BuildInitialize;

#[async_trait]
impl Action<Build> for BuildInitialize {
    fn name(&self) -> &'static str { "initialize" }
    fn can_handle(&self, build: &Build) -> bool { build.phase() == BuildPhase::Initialization }

    async fn handle(&self, _cx: &ActionContext<'_>, mut build: Build) -> Result<Option<Build>, EngineError> {
        let status = build.status_mut();
        status.image = None;
        status.base_image = None;
        status.image_digest = None;
        status.artifacts.clear();
        status.error = None;
        status.started_at = None;
        status.duration = None;
        status.phase = BuildPhase::Scheduling;
        Ok(Some(build))
    }
}

/// Hands the build to the runner once the namespace has a free slot.
pub struct BuildSchedule {
    runner: Arc<dyn BuildRunner>,
    // serialises slot accounting between workers of this process
    slots: Mutex<()>,
}

impl BuildSchedule {
    pub fn new(runner: Arc<dyn BuildRunner>) -> Self { Self { runner, slots: Mutex::new(()) } }
}

#[async_trait]
impl Action<Build> for BuildSchedule {
    fn name(&self) -> &'static str { "schedule" }
    fn can_handle(&self, build: &Build) -> bool { build.phase() == BuildPhase::Scheduling }

    async fn handle(&self, cx: &ActionContext<'_>, mut build: Build) -> Result<Option<Build>, EngineError> {
        let _slots = self.slots.lock().await;
        let ns = build.namespace().unwrap_or_default();
        let name = build.name_any();
        let limit = build.spec.platform.max_running_builds.max(1) as usize;

        let mut active: FxHashSet<String> = cx
            .store
            .list::<Build>(Some(&ns))
            .await?
            .into_iter()
            .filter(|b| b.phase().is_active())
            .map(|b| b.name_any())
            .collect();
        active.extend(self.runner.active(cx.store, &ns).await?);
        active.remove(&name);
        if active.len() >= limit {
            debug!(active = active.len(), limit, "no free build slot");
            return Ok(None);
        }

        self.runner.submit(cx.store, &build).await?;
        let status = build.status_mut();
        status.started_at = Some(Utc::now());
        status.phase = BuildPhase::Pending;
        Ok(Some(build))
    }
}

/// Tracks a submitted build through the runner.
pub struct BuildMonitor {
    runner: Arc<dyn BuildRunner>,
}

impl BuildMonitor {
    pub fn new(runner: Arc<dyn BuildRunner>) -> Self { Self { runner } }
}

#[async_trait]
impl Action<Build> for BuildMonitor {
    fn name(&self) -> &'static str { "monitor" }
    fn can_handle(&self, build: &Build) -> bool { build.phase().is_active() }

    async fn handle(&self, cx: &ActionContext<'_>, mut build: Build) -> Result<Option<Build>, EngineError> {
        let attempt_max = cx.config.build_attempt_max;
        let timeout = build.spec.timeout_seconds;
        let started = build.status.as_ref().and_then(|s| s.started_at);
        if let Some(started) = started {
            if timeout > 0 && (Utc::now() - started).num_seconds() >= i64::try_from(timeout).unwrap_or(i64::MAX) {
                warn!(timeout, "build timed out");
                self.runner.cancel(cx.store, &build).await?;
                fail(&mut build, format!("build timed out after {timeout}s"), attempt_max);
                return Ok(Some(build));
            }
        }

        match self.runner.poll(cx.store, &build).await? {
            RunState::Pending => Ok(None),
            RunState::Running => {
                if build.phase() == BuildPhase::Running {
                    return Ok(None);
                }
                build.set_phase(BuildPhase::Running);
                Ok(Some(build))
            }
            RunState::Succeeded(result) => {
                let status = build.status_mut();
                status.image = Some(result.image);
                status.base_image = result.base_image;
                status.image_digest = result.image_digest;
                status.artifacts = result.artifacts;
                status.duration = elapsed_since(status.started_at);
                status.phase = BuildPhase::Succeeded;
                info!(duration = ?status.duration, "build succeeded");
                Ok(Some(build))
            }
            RunState::Failed(reason) => {
                info!(reason = %reason, "build failed");
                fail(&mut build, reason, attempt_max);
                Ok(Some(build))
            }
            RunState::Lost => {
                warn!("runner lost track of the build");
                fail(&mut build, "build runner lost track of the build".into(), attempt_max);
                Ok(Some(build))
            }
        }
    }
}

/// Retries failed builds with exponential backoff, up to the attempt limit.
pub struct BuildErrorRecovery;

#[async_trait]
impl Action<Build> for BuildErrorRecovery {
    fn name(&self) -> &'static str { "error-recovery" }
    fn can_handle(&self, build: &Build) -> bool { build.phase() == BuildPhase::Failed }

    async fn handle(&self, cx: &ActionContext<'_>, mut build: Build) -> Result<Option<Build>, EngineError> {
        let now = Utc::now();
        let status = build.status_mut();
        let failure = status.failure.get_or_insert_with(|| Failure {
            reason: "unknown failure".into(),
            time: Some(now),
            ..Default::default()
        });
        if failure.recovery.attempt_max == 0 {
            failure.recovery.attempt_max = cx.config.build_attempt_max;
        }
        let recovery = &mut failure.recovery;

        if recovery.attempt >= recovery.attempt_max {
            let message = format!("build failed after {} recovery attempts: {}", recovery.attempt, failure.reason);
            info!(attempts = recovery.attempt, "giving up on build");
            status.error = Some(message);
            status.phase = BuildPhase::Error;
            return Ok(Some(build));
        }

        let last = recovery.attempt_time.or(failure.time).unwrap_or(now);
        let wait = cx.config.exponential(cx.config.recovery_base, recovery.attempt);
        let due = last + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        if now < due {
            debug!(attempt = recovery.attempt, due = %due, "recovery backoff pending");
            return Ok(None);
        }

        recovery.attempt += 1;
        recovery.attempt_time = Some(now);
        info!(attempt = recovery.attempt, max = recovery.attempt_max, "recovering build");
        status.phase = BuildPhase::Initialization;
        Ok(Some(build))
    }
}
