#![forbid(unsafe_code)]

use kiln_core::{Build, BuildSpec, Kit, KitSpec, Managed};
use kiln_store::{Store, StoreEventKind};
use kube::{Resource, ResourceExt};
use serde_json::json;

fn kit(name: &str, deps: &[&str]) -> Kit {
    let mut k = Kit::new(name, KitSpec { dependencies: deps.iter().map(|s| s.to_string()).collect(), ..Default::default() });
    k.metadata.namespace = Some("ns".into());
    k
}

fn build_owned_by(name: &str, owner: &Kit) -> Build {
    let mut b = Build::new(name, BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    b.metadata.owner_references = owner.controller_owner_ref(&()).map(|r| vec![r]);
    b
}

#[tokio::test]
async fn typed_round_trip() {
    let (store, _) = Store::memory();
    let created = store.create(&kit("a", &["camel:timer"])).await.unwrap();
    assert!(created.uid().is_some());
    let got: Kit = store.get("ns", "a").await.unwrap().unwrap();
    assert_eq!(got.spec.dependencies, vec!["camel:timer".to_string()]);
    assert!(store.get::<Kit>("ns", "missing").await.unwrap().is_none());
    assert!(store.get::<Kit>("other", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn generation_moves_only_on_spec_change() {
    let (store, _) = Store::memory();
    let mut k = store.create(&kit("a", &["camel:timer"])).await.unwrap();
    assert_eq!(k.meta().generation, Some(1));

    k.labels_mut().insert("x".into(), "y".into());
    let k = store.replace(&k).await.unwrap();
    assert_eq!(k.meta().generation, Some(1));

    let mut k2 = k.clone();
    k2.spec.dependencies.push("camel:log".into());
    let k2 = store.replace(&k2).await.unwrap();
    assert_eq!(k2.meta().generation, Some(2));

    // stale resourceVersion
    let err = store.replace(&k).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn replace_keeps_status() {
    let (store, _) = Store::memory();
    let k = store.create(&kit("a", &[])).await.unwrap();
    let patched: Kit = store.patch_status("ns", "a", json!({"status": {"phase": "Ready", "image": "img:1"}})).await.unwrap();
    assert_eq!(patched.status.as_ref().and_then(|s| s.image.as_deref()), Some("img:1"));

    let mut edit = k.clone();
    edit.metadata.resource_version = None;
    edit.status = None;
    let replaced = store.replace(&edit).await.unwrap();
    assert_eq!(replaced.status.as_ref().and_then(|s| s.image.as_deref()), Some("img:1"));
}

#[tokio::test]
async fn status_patch_merges_and_removes() {
    let (store, mem) = Store::memory();
    store.create(&kit("a", &[])).await.unwrap();
    store.patch_status::<Kit>("ns", "a", json!({"status": {"phase": "Error", "failure": {"reason": "boom"}}})).await.unwrap();
    let k: Kit = store.patch_status("ns", "a", json!({"status": {"phase": "Initialization", "failure": null}})).await.unwrap();
    assert_eq!(k.phase(), kiln_core::KitPhase::Initialization);
    assert!(k.status.as_ref().unwrap().failure.is_none());
    assert_eq!(mem.patch_count(), 2);
}

#[tokio::test]
async fn deleting_a_kit_reaps_its_builds() {
    let (store, mem) = Store::memory();
    let k = store.create(&kit("a", &[])).await.unwrap();
    let other = store.create(&kit("b", &[])).await.unwrap();
    store.create(&build_owned_by("a", &k)).await.unwrap();
    store.create(&build_owned_by("a-2", &k)).await.unwrap();
    store.create(&build_owned_by("b", &other)).await.unwrap();
    assert_eq!(mem.len(), 5);

    let mut rx = mem.subscribe();
    assert!(store.delete::<Kit>("ns", "a").await.unwrap());
    assert!(!store.delete::<Kit>("ns", "a").await.unwrap());

    let builds: Vec<Build> = store.list(Some("ns")).await.unwrap();
    assert_eq!(builds.iter().map(|b| b.name_any()).collect::<Vec<_>>(), vec!["b".to_string()]);

    let mut deleted = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        assert_eq!(ev.event, StoreEventKind::Deleted);
        deleted.push(format!("{}:{}", ev.kind, ev.key.name));
    }
    deleted.sort();
    assert_eq!(deleted, vec!["Build:a", "Build:a-2", "Kit:a"]);
}

#[tokio::test]
async fn list_is_scoped_by_namespace_and_kind() {
    let (store, _) = Store::memory();
    store.create(&kit("a", &[])).await.unwrap();
    let mut elsewhere = kit("z", &[]);
    elsewhere.metadata.namespace = Some("other".into());
    store.create(&elsewhere).await.unwrap();

    assert_eq!(store.list::<Kit>(Some("ns")).await.unwrap().len(), 1);
    assert_eq!(store.list::<Kit>(None).await.unwrap().len(), 2);
    assert!(store.list::<Build>(None).await.unwrap().is_empty());
}
