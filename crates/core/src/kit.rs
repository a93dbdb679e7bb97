//! Kit: the buildable unit of an integration (its dependencies and the image they produce).

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{digest, Artifact, Condition, Failure, Managed};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Kit",
    namespaced,
    status = "KitStatus",
    shortname = "ik",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KitSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Prebuilt image; when set no build is ever scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Explicit platform; falls back to the platform selector annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum KitPhase {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "Waiting For Platform")]
    WaitingForPlatform,
    Initialization,
    #[serde(rename = "Build Submitted")]
    BuildSubmitted,
    #[serde(rename = "Build Running")]
    BuildRunning,
    Ready,
    Error,
    #[serde(rename = "Cannot Build")]
    CannotBuild,
}

impl KitPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            KitPhase::None => "",
            KitPhase::WaitingForPlatform => "Waiting For Platform",
            KitPhase::Initialization => "Initialization",
            KitPhase::BuildSubmitted => "Build Submitted",
            KitPhase::BuildRunning => "Build Running",
            KitPhase::Ready => "Ready",
            KitPhase::Error => "Error",
            KitPhase::CannotBuild => "Cannot Build",
        }
    }
}

impl fmt::Display for KitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KitStatus {
    #[serde(default)]
    pub phase: KitPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    /// Name of the Build currently owned by this kit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub build_sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn is_zero(n: &u32) -> bool { *n == 0 }

crate::status_fields!(KitStatus, KitPhase);

impl Managed for Kit {
    type Status = KitStatus;

    fn status(&self) -> Option<&KitStatus> { self.status.as_ref() }
    fn status_mut(&mut self) -> &mut KitStatus { self.status.get_or_insert_with(Default::default) }
    fn compute_digest(&self) -> String { digest::kit(self) }
}

impl Kit {
    /// Literal image declared by the spec, ignoring empty strings.
    pub fn literal_image(&self) -> Option<&str> {
        self.spec.image.as_deref().filter(|s| !s.is_empty())
    }

    /// Name of the build this kit tracks: the recorded one, else the kit name.
    pub fn build_name(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.build.clone())
            .unwrap_or_else(|| kube::ResourceExt::name_any(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_serialize_with_spaces() {
        let v = serde_json::to_value(KitPhase::BuildSubmitted).unwrap();
        assert_eq!(v, serde_json::json!("Build Submitted"));
        let p: KitPhase = serde_json::from_value(serde_json::json!("")).unwrap();
        assert_eq!(p, KitPhase::None);
    }

    #[test]
    fn missing_status_reads_as_none_phase() {
        let kit = Kit::new("k", KitSpec::default());
        assert_eq!(kit.phase(), KitPhase::None);
        assert!(kit.conditions().is_empty());
        assert_eq!(kit.build_name(), "k");
    }
}
