//! Watchers: cluster changes in, work-queue keys out.
//!
//! | watched  | enqueued                                                   |
//! |----------|------------------------------------------------------------|
//! | Kit      | the kit, on generation or phase change                     |
//! | Build    | the build; its owner kit when the build phase changes      |
//! | Platform | the platform; waiting kits and builds once it turns Ready  |
//! | Job      | the owner build                                            |

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::Job;
use kiln_core::{Build, BuildPhase, Kit, KitPhase, Managed, ObjectKey, Platform, PlatformPhase};
use kiln_engine::WorkQueue;
use kiln_store::{Store, StoreError, StoreResult};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Queues {
    pub kits: Arc<WorkQueue>,
    pub builds: Arc<WorkQueue>,
    pub platforms: Arc<WorkQueue>,
}

impl Queues {
    pub fn new() -> Self {
        Self { kits: WorkQueue::new("kit"), builds: WorkQueue::new("build"), platforms: WorkQueue::new("platform") }
    }

    pub fn shutdown(&self) {
        self.kits.shutdown();
        self.builds.shutdown();
        self.platforms.shutdown();
    }
}

impl Default for Queues {
    fn default() -> Self { Self::new() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    generation: Option<i64>,
    phase: String,
}

/// What changed since the last time an object was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Delta {
    generation: bool,
    phase: bool,
}

impl Delta {
    fn any(self) -> bool { self.generation || self.phase }
}

/// Maps watch events onto queue keys.
pub struct Router {
    queues: Queues,
    store: Store,
    seen: Mutex<FxHashMap<(&'static str, ObjectKey), Seen>>,
}

fn owner_key<K: Resource>(obj: &K, kind: &str) -> Option<ObjectKey> {
    let ns = obj.meta().namespace.clone()?;
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == kind)
        .map(|o| ObjectKey::new(ns, o.name.clone()))
}

impl Router {
    pub fn new(queues: Queues, store: Store) -> Self { Self { queues, store, seen: Mutex::new(FxHashMap::default()) } }

    fn observe<K: Managed>(&self, kind: &'static str, obj: &K) -> Option<(ObjectKey, Delta)> {
        let key = ObjectKey::of(obj)?;
        let now = Seen { generation: obj.meta().generation, phase: obj.phase().to_string() };
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let delta = match seen.insert((kind, key.clone()), now.clone()) {
            None => Delta { generation: true, phase: true },
            Some(prev) => Delta { generation: prev.generation != now.generation, phase: prev.phase != now.phase },
        };
        Some((key, delta))
    }

    fn forget(&self, kind: &'static str, obj: &impl Resource) {
        if let Some(key) = ObjectKey::of(obj) {
            self.seen.lock().unwrap_or_else(|p| p.into_inner()).remove(&(kind, key));
        }
    }

    /// Drop cached state of `kind` objects missing from a fresh listing.
    fn resync(&self, kind: &'static str, live: &[ObjectKey]) {
        let live: FxHashSet<&ObjectKey> = live.iter().collect();
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let before = seen.len();
        seen.retain(|(k, key), _| *k != kind || live.contains(key));
        debug!(kind, evicted = before - seen.len(), "seen cache resynced");
    }

    pub fn kit(&self, kit: &Kit) {
        if let Some((key, delta)) = self.observe("Kit", kit) {
            if delta.any() {
                self.queues.kits.add(key);
            }
        }
    }

    pub fn build(&self, build: &Build) {
        let Some((key, delta)) = self.observe("Build", build) else { return };
        if delta.any() {
            self.queues.builds.add(key);
        }
        if delta.phase {
            if let Some(kit) = owner_key(build, "Kit") {
                debug!(kit = %kit, phase = %build.phase(), "build phase changed");
                self.queues.kits.add(kit);
            }
        }
    }

    pub async fn platform(&self, platform: &Platform) -> StoreResult<()> {
        let Some((key, delta)) = self.observe("Platform", platform) else { return Ok(()) };
        if delta.any() {
            self.queues.platforms.add(key.clone());
        }
        if delta.phase && platform.phase() == PlatformPhase::Ready {
            self.wake_waiting(&key.namespace).await?;
        }
        Ok(())
    }

    pub fn job(&self, job: &Job) {
        if let Some(build) = owner_key(job, "Build") {
            self.queues.builds.add(build);
        }
    }

    /// Kits and builds of `ns` still waiting for a platform.
    async fn wake_waiting(&self, ns: &str) -> StoreResult<()> {
        for kit in self.store.list::<Kit>(Some(ns)).await? {
            if kit.phase() == KitPhase::WaitingForPlatform {
                if let Some(key) = ObjectKey::of(&kit) {
                    self.queues.kits.add(key);
                }
            }
        }
        for build in self.store.list::<Build>(Some(ns)).await? {
            if build.phase() == BuildPhase::WaitingForPlatform {
                if let Some(key) = ObjectKey::of(&build) {
                    self.queues.builds.add(key);
                }
            }
        }
        Ok(())
    }
}

/// Watch streams feeding a [`Router`].
pub struct Watchers {
    client: Client,
    namespace: Option<String>,
    router: Arc<Router>,
}

impl Watchers {
    pub fn new(client: Client, store: Store, namespace: Option<String>, queues: Queues) -> Self {
        Self { client, namespace, router: Arc::new(Router::new(queues, store)) }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let router = self.router.clone();
        let kits = {
            let r = router.clone();
            spawn_watch("Kit", self.api::<Kit>(), cancel.clone(), move |ev| {
                let r = r.clone();
                async move {
                    match ev {
                        Change::Applied(kit) => r.kit(&kit),
                        Change::Deleted(kit) => r.forget("Kit", &kit),
                        Change::Resynced(keys) => r.resync("Kit", &keys),
                    }
                    Ok::<(), StoreError>(())
                }
            })
        };
        let builds = {
            let r = router.clone();
            spawn_watch("Build", self.api::<Build>(), cancel.clone(), move |ev| {
                let r = r.clone();
                async move {
                    match ev {
                        Change::Applied(build) => r.build(&build),
                        Change::Deleted(build) => r.forget("Build", &build),
                        Change::Resynced(keys) => r.resync("Build", &keys),
                    }
                    Ok::<(), StoreError>(())
                }
            })
        };
        let platforms = {
            let r = router.clone();
            spawn_watch("Platform", self.api::<Platform>(), cancel.clone(), move |ev| {
                let r = r.clone();
                async move {
                    match ev {
                        Change::Applied(platform) => r.platform(&platform).await?,
                        Change::Deleted(platform) => r.forget("Platform", &platform),
                        Change::Resynced(keys) => r.resync("Platform", &keys),
                    }
                    Ok::<(), StoreError>(())
                }
            })
        };
        let jobs = {
            let r = router;
            spawn_watch("Job", self.api::<Job>(), cancel, move |ev| {
                let r = r.clone();
                async move {
                    if let Change::Applied(job) = ev {
                        r.job(&job);
                    }
                    Ok::<(), StoreError>(())
                }
            })
        };
        vec![kits, builds, platforms, jobs]
    }
}

/// A watch event flattened to one object, or the key set of a relist.
pub enum Change<K> {
    Applied(K),
    Deleted(K),
    Resynced(Vec<ObjectKey>),
}

fn flatten<K: Resource>(ev: Event<K>) -> Vec<Change<K>> {
    match ev {
        Event::Applied(o) => vec![Change::Applied(o)],
        Event::Deleted(o) => vec![Change::Deleted(o)],
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let keys = list.iter().filter_map(ObjectKey::of).collect();
            std::iter::once(Change::Resynced(keys)).chain(list.into_iter().map(Change::Applied)).collect()
        }
    }
}

fn spawn_watch<K, F, Fut>(kind: &'static str, api: Api<K>, cancel: CancellationToken, handle: F) -> JoinHandle<()>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    F: Fn(Change<K>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = StoreResult<()>> + Send,
{
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind, "watcher started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.try_next() => next,
            };
            match next {
                Ok(Some(ev)) => {
                    for change in flatten(ev) {
                        if let Err(e) = handle(change).await {
                            warn!(kind, error = %e, "failed to route watch event");
                        }
                    }
                }
                Ok(None) => {
                    warn!(kind, "watch stream ended");
                    break;
                }
                Err(e) => warn!(kind, error = %e, "watch error"),
            }
        }
        info!(kind, "watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{BuildSpec, KitSpec, PlatformSpec};
    use kube::api::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn router() -> (Router, Queues, Store) {
        let (store, _) = Store::memory();
        let queues = Queues::new();
        (Router::new(queues.clone(), store.clone()), queues, store)
    }

    fn meta(name: &str, generation: i64) -> ObjectMeta {
        ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), generation: Some(generation), ..Default::default() }
    }

    fn owned_by(kind: &str, name: &str) -> Vec<OwnerReference> {
        vec![OwnerReference {
            api_version: "kiln.dev/v1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: "u".into(),
            controller: Some(true),
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn kits_are_queued_on_generation_or_phase_change_only() {
        let (r, q, _) = router();
        let mut kit = Kit::new("k", KitSpec::default());
        kit.metadata = meta("k", 1);
        r.kit(&kit);
        let key = q.kits.get().await.unwrap();
        q.kits.done(&key);

        r.kit(&kit);
        assert!(q.kits.is_empty());

        kit.status_mut().phase = KitPhase::Initialization;
        r.kit(&kit);
        assert_eq!(q.kits.len(), 1);
        let key = q.kits.get().await.unwrap();
        q.kits.done(&key);

        kit.metadata.generation = Some(2);
        r.kit(&kit);
        assert_eq!(q.kits.len(), 1);
    }

    #[tokio::test]
    async fn build_phase_change_wakes_the_owner_kit() {
        let (r, q, _) = router();
        let mut build = Build::new("k", BuildSpec::default());
        build.metadata = ObjectMeta { owner_references: Some(owned_by("Kit", "k")), ..meta("k", 1) };
        r.build(&build);
        assert_eq!(q.builds.get().await, Some(ObjectKey::new("ns", "k")));
        assert_eq!(q.kits.get().await, Some(ObjectKey::new("ns", "k")));
    }

    #[tokio::test]
    async fn jobs_map_to_their_build() {
        let (r, q, _) = router();
        let job = Job {
            metadata: ObjectMeta { owner_references: Some(owned_by("Build", "k-2")), ..meta("k-2-builder-0", 1) },
            ..Default::default()
        };
        r.job(&job);
        assert_eq!(q.builds.get().await, Some(ObjectKey::new("ns", "k-2")));
        assert!(q.kits.is_empty());
    }

    #[tokio::test]
    async fn ready_platform_wakes_waiting_kits() {
        let (r, q, store) = router();
        for name in ["waiting", "other"] {
            let mut kit = Kit::new(name, KitSpec::default());
            kit.metadata.namespace = Some("ns".into());
            store.create(&kit).await.unwrap();
        }
        store
            .patch_status::<Kit>("ns", "waiting", serde_json::json!({"status": {"phase": "Waiting For Platform"}}))
            .await
            .unwrap();

        let mut platform = Platform::new("kiln", PlatformSpec::default());
        platform.metadata = meta("kiln", 1);
        platform.status_mut().phase = PlatformPhase::Ready;
        r.platform(&platform).await.unwrap();

        assert_eq!(q.platforms.len(), 1);
        assert_eq!(q.kits.len(), 1);
        assert_eq!(q.kits.get().await, Some(ObjectKey::new("ns", "waiting")));
    }

    #[tokio::test]
    async fn restart_evicts_objects_deleted_during_the_gap() {
        let (r, q, _) = router();
        let mut a = Kit::new("a", KitSpec::default());
        a.metadata = meta("a", 1);
        let mut b = Kit::new("b", KitSpec::default());
        b.metadata = meta("b", 1);
        let mut platform = Platform::new("kiln", PlatformSpec::default());
        platform.metadata = meta("kiln", 1);
        r.kit(&a);
        r.kit(&b);
        r.platform(&platform).await.unwrap();
        for _ in 0..2 {
            let key = q.kits.get().await.unwrap();
            q.kits.done(&key);
        }

        let mut changes = flatten(Event::Restarted(vec![a.clone()]));
        assert_eq!(changes.len(), 2);
        match changes.remove(0) {
            Change::Resynced(keys) => r.resync("Kit", &keys),
            _ => panic!("relist must lead with the live key set"),
        }
        {
            let seen = r.seen.lock().unwrap();
            assert!(seen.contains_key(&("Kit", ObjectKey::new("ns", "a"))));
            assert!(!seen.contains_key(&("Kit", ObjectKey::new("ns", "b"))));
            assert!(seen.contains_key(&("Platform", ObjectKey::new("ns", "kiln"))));
        }

        // unchanged survivor stays quiet
        r.kit(&a);
        assert!(q.kits.is_empty());
    }
}
