//! Build: a one-shot job producing the image of exactly one kit.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{digest, Artifact, Condition, Failure, Managed};

/// Platform settings frozen into the build when it is composed.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSnapshot {
    pub name: String,
    pub registry: String,
    #[serde(default)]
    pub insecure: bool,
    pub base_image: String,
    pub builder_image: String,
    pub max_running_builds: u32,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Attempt","type":"integer","jsonPath":".status.failure.recovery.attempt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    pub platform: PlatformSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<String>,
    /// Target image reference.
    pub image: String,
    pub base_image: String,
    #[serde(default)]
    pub steps: Vec<String>,
    pub timeout_seconds: u64,
    /// Digest of the kit this build was composed for.
    pub kit_digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum BuildPhase {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "Waiting For Platform")]
    WaitingForPlatform,
    Initialization,
    Scheduling,
    Pending,
    Running,
    Succeeded,
    Failed,
    Interrupted,
    Error,
}

impl BuildPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::None => "",
            BuildPhase::WaitingForPlatform => "Waiting For Platform",
            BuildPhase::Initialization => "Initialization",
            BuildPhase::Scheduling => "Scheduling",
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Succeeded => "Succeeded",
            BuildPhase::Failed => "Failed",
            BuildPhase::Interrupted => "Interrupted",
            BuildPhase::Error => "Error",
        }
    }

    /// No further transitions happen without a new build.
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildPhase::Succeeded | BuildPhase::Error | BuildPhase::Interrupted)
    }

    /// Holds a runner slot.
    pub fn is_active(self) -> bool { matches!(self, BuildPhase::Pending | BuildPhase::Running) }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Free-form error message of the last terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::status_fields!(BuildStatus, BuildPhase);

impl Managed for Build {
    type Status = BuildStatus;

    fn status(&self) -> Option<&BuildStatus> { self.status.as_ref() }
    fn status_mut(&mut self) -> &mut BuildStatus { self.status.get_or_insert_with(Default::default) }
    fn compute_digest(&self) -> String { digest::build(self) }

    fn phase_note(&self) -> Option<String> {
        let recovery = &self.status.as_ref()?.failure.as_ref()?.recovery;
        Some(format!("(recovery {} of {})", recovery.attempt, recovery.attempt_max))
    }
}

impl Build {
    pub fn recovery_attempt(&self) -> u32 {
        self.status
            .as_ref()
            .and_then(|s| s.failure.as_ref())
            .map(|f| f.recovery.attempt)
            .unwrap_or(0)
    }
}
