//! Platform gate: nothing is built until the resource's platform is ready.

use std::marker::PhantomData;

use async_trait::async_trait;
use kiln_core::condition;
use kiln_core::{Build, BuildPhase, ConditionStatus, Kit, KitPhase, Managed, PhaseOf};
use kiln_engine::{Action, ActionContext, EngineError, Resolution};
use tracing::debug;

pub const PLATFORM_AVAILABLE: &str = "PlatformAvailable";

/// A kind that waits for its platform before doing anything else.
pub trait Gated: Managed {
    const WAITING: PhaseOf<Self>;
    const INITIAL: PhaseOf<Self>;

    /// Platform explicitly requested by the resource itself.
    fn platform_ref(&self) -> Option<&str>;
    fn record_platform(&mut self, name: String);
}

impl Gated for Kit {
    const WAITING: KitPhase = KitPhase::WaitingForPlatform;
    const INITIAL: KitPhase = KitPhase::Initialization;

    fn platform_ref(&self) -> Option<&str> { self.spec.platform.as_deref() }
    fn record_platform(&mut self, name: String) { self.status_mut().platform = Some(name) }
}

impl Gated for Build {
    const WAITING: BuildPhase = BuildPhase::WaitingForPlatform;
    const INITIAL: BuildPhase = BuildPhase::Initialization;

    fn platform_ref(&self) -> Option<&str> { Some(self.spec.platform.name.as_str()).filter(|s| !s.is_empty()) }
    fn record_platform(&mut self, name: String) { self.status_mut().platform = Some(name) }
}

pub struct PlatformGate<K>(PhantomData<fn() -> K>);

impl<K> PlatformGate<K> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<K> Default for PlatformGate<K> {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl<K: Gated> Action<K> for PlatformGate<K> {
    fn name(&self) -> &'static str { "platform-gate" }

    fn can_handle(&self, target: &K) -> bool {
        let phase = target.phase();
        phase == <PhaseOf<K> as Default>::default() || phase == K::WAITING
    }

    async fn handle(&self, cx: &ActionContext<'_>, mut target: K) -> Result<Option<K>, EngineError> {
        let explicit = target.platform_ref().map(str::to_string);
        match cx.platforms.resolve(cx.store, &target, explicit.as_deref()).await? {
            Resolution::Ready(platform) => {
                let name = platform.name();
                condition::set(
                    target.conditions_mut(),
                    PLATFORM_AVAILABLE,
                    ConditionStatus::True,
                    "PlatformAvailable",
                    format!("{name} is ready"),
                );
                target.record_platform(name);
                target.set_phase(K::INITIAL);
                Ok(Some(target))
            }
            Resolution::Waiting(reason) => {
                if target.phase() == K::WAITING {
                    debug!(reason = %reason, "still waiting for platform");
                    return Ok(None);
                }
                condition::set(target.conditions_mut(), PLATFORM_AVAILABLE, ConditionStatus::False, "PlatformNotReady", reason);
                target.set_phase(K::WAITING);
                Ok(Some(target))
            }
        }
    }
}
