//! kiln core types: the custom resources reconciled by the control plane and
//! the accessors the generic engine needs to drive them.

#![forbid(unsafe_code)]

use std::fmt::{self, Debug, Display};

use chrono::{DateTime, Utc};
use kube::Resource;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod build;
pub mod condition;
pub mod digest;
pub mod kit;
pub mod platform;
pub mod vocabulary;

pub use build::{Build, BuildPhase, BuildSpec, BuildStatus, PlatformSnapshot};
pub use condition::{Condition, ConditionStatus};
pub use kit::{Kit, KitPhase, KitSpec, KitStatus};
pub use platform::{
    Platform, PlatformBuildSpec, PlatformPhase, PlatformSpec, PlatformStatus, Profile, ProfileSpec,
    RegistrySpec,
};
pub use vocabulary::Vocabulary;

/// API group shared by every kiln resource.
pub const GROUP: &str = "kiln.dev";

/// Name of the platform looked up (and operator id assumed) when nothing else is configured.
pub const DEFAULT_PLATFORM_NAME: &str = "kiln";

/// Namespaced identity of one object of a known kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an existing object; `None` for cluster-scoped or unnamed objects.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Why something failed and how far its automatic recovery has gone.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recovery: Recovery,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recovery {
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub attempt_max: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_time: Option<DateTime<Utc>>,
}

/// A file produced by a build and layered into the kit image.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Common fields of every reconciled status block.
pub trait StatusFields: Clone + Debug + Default + Serialize + PartialEq + Send + Sync + 'static {
    type Phase: Copy + Eq + Debug + Display + Default + Send + Sync + 'static;

    fn phase(&self) -> Self::Phase;
    fn set_phase(&mut self, phase: Self::Phase);
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn digest(&self) -> Option<&str>;
    fn set_digest(&mut self, digest: String);
    fn observed_generation(&self) -> Option<i64>;
    fn set_observed_generation(&mut self, generation: Option<i64>);
}

macro_rules! status_fields {
    ($status:ty, $phase:ty) => {
        impl $crate::StatusFields for $status {
            type Phase = $phase;

            fn phase(&self) -> $phase { self.phase }
            fn set_phase(&mut self, phase: $phase) { self.phase = phase; }
            fn conditions(&self) -> &[$crate::Condition] { &self.conditions }
            fn conditions_mut(&mut self) -> &mut Vec<$crate::Condition> { &mut self.conditions }
            fn digest(&self) -> Option<&str> { self.digest.as_deref() }
            fn set_digest(&mut self, digest: String) { self.digest = Some(digest); }
            fn observed_generation(&self) -> Option<i64> { self.observed_generation }
            fn set_observed_generation(&mut self, generation: Option<i64>) {
                self.observed_generation = generation;
            }
        }
    };
}
pub(crate) use status_fields;

/// Phase type of a managed kind.
pub type PhaseOf<K> = <<K as Managed>::Status as StatusFields>::Phase;

/// A custom resource driven by the reconciliation engine.
pub trait Managed:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Status: StatusFields;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Self::Status;

    /// Content hash over the spec-relevant fields of this object.
    fn compute_digest(&self) -> String;

    /// Extra text appended to phase transition events.
    fn phase_note(&self) -> Option<String> { None }

    fn phase(&self) -> PhaseOf<Self> { self.status().map(|s| s.phase()).unwrap_or_default() }
    fn set_phase(&mut self, phase: PhaseOf<Self>) { self.status_mut().set_phase(phase) }
    fn conditions(&self) -> &[Condition] { self.status().map(|s| s.conditions()).unwrap_or(&[]) }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { self.status_mut().conditions_mut() }
    fn digest(&self) -> Option<&str> { self.status().and_then(|s| s.digest()) }
    fn set_digest(&mut self, digest: String) { self.status_mut().set_digest(digest) }
    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.status_mut().set_observed_generation(generation)
    }

    /// The status block as JSON (`null` when absent).
    fn status_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.status())
    }
}

/// Replace the tag of an image reference with a content digest: `repo:tag` + `sha256:..` -> `repo@sha256:..`.
pub fn pin_image(image: &str, digest: &str) -> String {
    let repo = match (image.rfind(':'), image.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => &image[..colon],
        (Some(colon), None) => &image[..colon],
        _ => image,
    };
    format!("{repo}@{digest}")
}
