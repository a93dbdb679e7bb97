//! Build environment of a kit: what gets built, on which runtime, in which steps.

use async_trait::async_trait;
use kiln_core::Kit;
use kiln_engine::ResolvedPlatform;

pub const DEFAULT_STEPS: &[&str] = &["resolve-dependencies", "assemble", "build-image", "publish-image"];

/// Runtime catalog the dependencies are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub runtime_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub dependencies: Vec<String>,
    /// `None` when no catalog exists for the requested runtime: the kit cannot be built.
    pub catalog: Option<Catalog>,
    pub steps: Vec<String>,
    pub runtime_version: Option<String>,
}

#[async_trait]
pub trait EnvironmentResolver: Send + Sync {
    async fn resolve(&self, kit: &Kit, platform: &ResolvedPlatform) -> anyhow::Result<Environment>;
}

/// Property a kit can set to pin its runtime version.
pub const RUNTIME_VERSION_PROPERTY: &str = "runtime.version";

/// Environment straight from the platform's build settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformDefaults;

pub fn normalize_dependencies(deps: &[String]) -> Vec<String> {
    let mut out: Vec<String> = deps.iter().map(|d| d.trim()).filter(|d| !d.is_empty()).map(str::to_string).collect();
    out.sort();
    out.dedup();
    out
}

#[async_trait]
impl EnvironmentResolver for PlatformDefaults {
    async fn resolve(&self, kit: &Kit, platform: &ResolvedPlatform) -> anyhow::Result<Environment> {
        for dep in &kit.spec.dependencies {
            let dep = dep.trim();
            if !dep.is_empty() && !dep.contains(':') {
                anyhow::bail!("dependency {dep:?} has no scheme (expected e.g. camel:timer or mvn:group:artifact:version)");
            }
        }
        let runtime_version = kit
            .spec
            .properties
            .get(RUNTIME_VERSION_PROPERTY)
            .cloned()
            .or_else(|| platform.build.runtime_version.clone());
        Ok(Environment {
            dependencies: normalize_dependencies(&kit.spec.dependencies),
            catalog: runtime_version.clone().map(|runtime_version| Catalog { runtime_version }),
            steps: DEFAULT_STEPS.iter().map(|s| s.to_string()).collect(),
            runtime_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{KitSpec, Platform, PlatformBuildSpec, PlatformSpec};

    fn platform(runtime: Option<&str>) -> ResolvedPlatform {
        let spec = PlatformSpec {
            build: PlatformBuildSpec { runtime_version: runtime.map(str::to_string), ..Default::default() },
            ..Default::default()
        };
        ResolvedPlatform::new(Platform::new("kiln", spec), None)
    }

    fn kit(deps: &[&str]) -> Kit {
        Kit::new("k", KitSpec { dependencies: deps.iter().map(|s| s.to_string()).collect(), ..Default::default() })
    }

    #[tokio::test]
    async fn dependencies_are_normalized() {
        let env = PlatformDefaults.resolve(&kit(&[" camel:timer", "camel:log", "camel:timer"]), &platform(Some("3.2"))).await.unwrap();
        assert_eq!(env.dependencies, vec!["camel:log".to_string(), "camel:timer".to_string()]);
        assert_eq!(env.catalog, Some(Catalog { runtime_version: "3.2".into() }));
        assert_eq!(env.steps.len(), DEFAULT_STEPS.len());
    }

    #[tokio::test]
    async fn no_runtime_means_no_catalog() {
        let env = PlatformDefaults.resolve(&kit(&["camel:timer"]), &platform(None)).await.unwrap();
        assert!(env.catalog.is_none());
    }

    #[tokio::test]
    async fn kit_property_pins_runtime() {
        let mut k = kit(&[]);
        k.spec.properties.insert(RUNTIME_VERSION_PROPERTY.into(), "4.0".into());
        let env = PlatformDefaults.resolve(&k, &platform(Some("3.2"))).await.unwrap();
        assert_eq!(env.runtime_version.as_deref(), Some("4.0"));
    }

    #[tokio::test]
    async fn schemeless_dependencies_are_rejected() {
        assert!(PlatformDefaults.resolve(&kit(&["timer"]), &platform(Some("3.2"))).await.is_err());
    }
}
