//! Platform and Profile: per-namespace build settings and the readiness gate in front of them.

use std::fmt;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{digest, Condition, Managed};

pub const DEFAULT_BASE_IMAGE: &str = "eclipse-temurin:17";
pub const DEFAULT_BUILDER_IMAGE: &str = "ghcr.io/kiln-dev/kiln-builder:latest";
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RUNNING_BUILDS: u32 = 1;

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub insecure: bool,
}

/// Build settings; every field is optional so profiles can overlay platforms.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformBuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_running_builds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,
}

impl PlatformBuildSpec {
    /// Fields set in `other` win.
    pub fn overlay(&self, other: &PlatformBuildSpec) -> PlatformBuildSpec {
        PlatformBuildSpec {
            runtime_version: other.runtime_version.clone().or_else(|| self.runtime_version.clone()),
            base_image: other.base_image.clone().or_else(|| self.base_image.clone()),
            timeout_seconds: other.timeout_seconds.or(self.timeout_seconds),
            max_running_builds: other.max_running_builds.or(self.max_running_builds),
            builder_image: other.builder_image.clone().or_else(|| self.builder_image.clone()),
        }
    }

    pub fn base_image_or_default(&self) -> &str { self.base_image.as_deref().unwrap_or(DEFAULT_BASE_IMAGE) }
    pub fn builder_image_or_default(&self) -> &str {
        self.builder_image.as_deref().unwrap_or(DEFAULT_BUILDER_IMAGE)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_BUILD_TIMEOUT_SECS))
    }
    pub fn max_running_builds_or_default(&self) -> u32 {
        self.max_running_builds.unwrap_or(DEFAULT_MAX_RUNNING_BUILDS)
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Platform",
    namespaced,
    status = "PlatformStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default)]
    pub registry: RegistrySpec,
    #[serde(default)]
    pub build: PlatformBuildSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum PlatformPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Ready,
    Error,
}

impl PlatformPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformPhase::None => "",
            PlatformPhase::Ready => "Ready",
            PlatformPhase::Error => "Error",
        }
    }
}

impl fmt::Display for PlatformPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(default)]
    pub phase: PlatformPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::status_fields!(PlatformStatus, PlatformPhase);

impl Managed for Platform {
    type Status = PlatformStatus;

    fn status(&self) -> Option<&PlatformStatus> { self.status.as_ref() }
    fn status_mut(&mut self) -> &mut PlatformStatus { self.status.get_or_insert_with(Default::default) }
    fn compute_digest(&self) -> String { digest::platform(self) }
}

impl Platform {
    pub fn is_ready(&self) -> bool { self.phase() == PlatformPhase::Ready }
}

/// Overlay on a platform's build settings, selected per resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "kiln.dev", version = "v1", kind = "Profile", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default)]
    pub build: PlatformBuildSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_profile_fields() {
        let base = PlatformBuildSpec {
            runtime_version: Some("3.2".into()),
            timeout_seconds: Some(60),
            ..Default::default()
        };
        let profile = PlatformBuildSpec { timeout_seconds: Some(120), ..Default::default() };
        let eff = base.overlay(&profile);
        assert_eq!(eff.runtime_version.as_deref(), Some("3.2"));
        assert_eq!(eff.timeout(), Duration::from_secs(120));
        assert_eq!(eff.max_running_builds_or_default(), 1);
        assert_eq!(eff.base_image_or_default(), DEFAULT_BASE_IMAGE);
    }
}
