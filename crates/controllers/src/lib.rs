//! kiln controllers: the kit, build and platform state machines plus the
//! collaborators they drive (environment resolution, build runners).

#![forbid(unsafe_code)]

use std::sync::Arc;

use kiln_core::{Build, BuildPhase, Kit, KitPhase, Platform};
use kiln_engine::{Dispatcher, Pipeline, Runtime};

pub mod build;
pub mod env;
pub mod gate;
pub mod kit;
pub mod platform;
pub mod runner;

pub use env::{Catalog, Environment, EnvironmentResolver, PlatformDefaults};
pub use gate::{Gated, PlatformGate};
pub use runner::{BuildRunner, JobRunner, RunResult, RunState};

pub fn kit_pipeline(resolver: Arc<dyn EnvironmentResolver>) -> Pipeline<Kit> {
    Pipeline::new()
        .then(PlatformGate::<Kit>::new())
        .then(kit::KitInitialize::new(resolver.clone()))
        .then(kit::KitBuildSubmit::new(resolver))
        .then(kit::KitBuildPoll)
        .then(kit::KitMonitor)
        .then(kit::KitErrorRecovery)
        .requeue_while(&[KitPhase::WaitingForPlatform, KitPhase::BuildSubmitted, KitPhase::BuildRunning])
}

pub fn build_pipeline(runner: Arc<dyn BuildRunner>) -> Pipeline<Build> {
    Pipeline::new()
        .then(PlatformGate::<Build>::new())
        .then(build::BuildInitialize)
        .then(build::BuildSchedule::new(runner.clone()))
        .then(build::BuildMonitor::new(runner))
        .then(build::BuildErrorRecovery)
        .requeue_while(&[
            BuildPhase::WaitingForPlatform,
            BuildPhase::Scheduling,
            BuildPhase::Pending,
            BuildPhase::Running,
            BuildPhase::Failed,
        ])
}

pub fn platform_pipeline() -> Pipeline<Platform> {
    Pipeline::new().then(platform::PlatformInitialize).then(platform::PlatformMonitor)
}

/// One dispatcher per kind, sharing a runtime.
#[derive(Clone)]
pub struct Controllers {
    pub kits: Arc<Dispatcher<Kit>>,
    pub builds: Arc<Dispatcher<Build>>,
    pub platforms: Arc<Dispatcher<Platform>>,
}

impl Controllers {
    pub fn new(rt: Runtime, resolver: Arc<dyn EnvironmentResolver>, runner: Arc<dyn BuildRunner>) -> Self {
        Self {
            kits: Arc::new(Dispatcher::new(rt.clone(), kit_pipeline(resolver))),
            builds: Arc::new(Dispatcher::new(rt.clone(), build_pipeline(runner))),
            platforms: Arc::new(Dispatcher::new(rt, platform_pipeline())),
        }
    }

    /// Default collaborators: platform-derived environments and Job-backed builds.
    pub fn with_defaults(rt: Runtime) -> Self {
        let runner = Arc::new(JobRunner::new(rt.vocabulary.clone()));
        Self::new(rt, Arc::new(PlatformDefaults), runner)
    }
}
