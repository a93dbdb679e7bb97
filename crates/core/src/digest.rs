//! Content digests over the spec-relevant fields of each kind.
//!
//! A digest is `"v"` followed by the URL-safe, unpadded base64 of a SHA-256
//! over tagged fields. Status is never hashed, so writing a digest back into
//! status does not change it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest as _, Sha256};

use crate::{Build, Kit, Platform};

/// Bumped whenever the hashed field set changes, invalidating every stored digest.
pub const DIGEST_VERSION: &str = "1";

/// Incremental digest builder; every field is written as `name\0value\0`.
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new(scope: &str) -> Self {
        let mut d = Self { hasher: Sha256::new() };
        d.write("version", DIGEST_VERSION);
        d.write("scope", scope);
        d
    }

    fn write(&mut self, name: &str, value: &str) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(value.as_bytes());
        self.hasher.update([0u8]);
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.write(name, value);
        self
    }

    /// Absent and empty values hash the same.
    pub fn opt(self, name: &str, value: Option<&str>) -> Self { self.field(name, value.unwrap_or("")) }

    pub fn list<'a>(mut self, name: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        for v in values {
            self.write(name, v);
        }
        self
    }

    pub fn finish(self) -> String {
        format!("v{}", URL_SAFE_NO_PAD.encode(self.hasher.finalize()))
    }
}

/// Dependencies are hashed trimmed, sorted and deduplicated: their order never matters.
pub fn kit(kit: &Kit) -> String {
    let spec = &kit.spec;
    let mut deps: Vec<&str> = spec.dependencies.iter().map(|d| d.trim()).filter(|d| !d.is_empty()).collect();
    deps.sort_unstable();
    deps.dedup();
    let mut d = Digester::new("kit")
        .opt("image", kit.literal_image())
        .list("dependency", deps)
        .list("repository", spec.repositories.iter().map(String::as_str))
        .opt("buildDir", spec.build_dir.as_deref())
        .opt("platform", spec.platform.as_deref());
    for (k, v) in &spec.properties {
        d = d.field("property", k).field("value", v);
    }
    d.finish()
}

pub fn build(build: &Build) -> String {
    let spec = &build.spec;
    let timeout = spec.timeout_seconds.to_string();
    Digester::new("build")
        .list("dependency", spec.dependencies.iter().map(String::as_str))
        .opt("runtimeVersion", spec.runtime_version.as_deref())
        .field("platform", &spec.platform.name)
        .field("registry", &spec.platform.registry)
        .field("image", &spec.image)
        .field("baseImage", &spec.base_image)
        .opt("buildDir", spec.build_dir.as_deref())
        .list("step", spec.steps.iter().map(String::as_str))
        .field("timeout", &timeout)
        .field("kitDigest", &spec.kit_digest)
        .finish()
}

pub fn platform(platform: &Platform) -> String {
    let spec = &platform.spec;
    let b = &spec.build;
    let timeout = b.timeout_seconds.map(|t| t.to_string());
    let max = b.max_running_builds.map(|m| m.to_string());
    Digester::new("platform")
        .field("registry", &spec.registry.address)
        .field("insecure", if spec.registry.insecure { "true" } else { "false" })
        .opt("runtimeVersion", b.runtime_version.as_deref())
        .opt("baseImage", b.base_image.as_deref())
        .opt("timeout", timeout.as_deref())
        .opt("maxRunningBuilds", max.as_deref())
        .opt("builderImage", b.builder_image.as_deref())
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KitSpec, Managed};

    fn kit_with(deps: &[&str]) -> Kit {
        Kit::new("k", KitSpec { dependencies: deps.iter().map(|s| s.to_string()).collect(), ..Default::default() })
    }

    #[test]
    fn format_is_prefixed_urlsafe() {
        let d = kit_with(&["camel:timer"]).compute_digest();
        assert!(d.starts_with('v'));
        assert_eq!(d.len(), 1 + 43);
        assert!(!d.contains('+') && !d.contains('/') && !d.contains('='));
    }

    #[test]
    fn dependency_order_does_not_matter() {
        let a = kit_with(&["camel:timer", "camel:log"]).compute_digest();
        let b = kit_with(&["camel:log", "camel:timer", "camel:log"]).compute_digest();
        assert_eq!(a, b);
        assert_ne!(a, kit_with(&["camel:log"]).compute_digest());
    }

    #[test]
    fn status_is_not_hashed() {
        let mut k = kit_with(&["camel:timer"]);
        let before = k.compute_digest();
        k.status_mut().image = Some("img:1".into());
        k.set_digest(before.clone());
        assert_eq!(k.compute_digest(), before);
    }

    #[test]
    fn literal_image_changes_digest() {
        let mut k = kit_with(&[]);
        let before = k.compute_digest();
        k.spec.image = Some("registry/img:tag".into());
        assert_ne!(k.compute_digest(), before);
        k.spec.image = Some(String::new());
        assert_eq!(k.compute_digest(), before);
    }
}
