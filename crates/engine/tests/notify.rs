#![forbid(unsafe_code)]

use std::sync::Arc;

use kiln_core::condition;
use kiln_core::{
    Build, BuildPhase, BuildSpec, ConditionStatus, Failure, Kit, KitPhase, KitSpec, Managed, Recovery, Vocabulary,
};
use kiln_engine::{EventKind, MemoryEvents, Notifier};
use kube::Resource;

fn notifier() -> (Notifier, Arc<MemoryEvents>) {
    let events = Arc::new(MemoryEvents::new());
    (Notifier::new(events.clone(), Arc::new(Vocabulary::default())), events)
}

fn kit() -> Kit {
    let mut k = Kit::new("k", KitSpec::default());
    k.metadata.namespace = Some("ns".into());
    k.metadata.uid = Some("uid-k".into());
    k
}

fn owned_build(owner: &Kit) -> Build {
    let mut b = Build::new("k", BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    b.metadata.owner_references = owner.controller_owner_ref(&()).map(|r| vec![r]);
    b
}

#[tokio::test]
async fn phase_change_notifies_resource_and_owner() {
    let (n, events) = notifier();
    let k = kit();
    let old = owned_build(&k);
    let mut new = old.clone();
    new.set_phase(BuildPhase::Running);
    n.updated(Some(&old), &new).await;

    let recorded = events.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].0.kind.as_deref(), Some("Build"));
    assert_eq!(recorded[0].1.reason, "BuildPhaseUpdated");
    assert_eq!(recorded[0].1.note, "Build \"k\" in phase \"Running\"");
    assert_eq!(recorded[1].0.kind.as_deref(), Some("Kit"));
    assert_eq!(recorded[1].0.uid.as_deref(), Some("uid-k"));
    assert_eq!(recorded[1].1.reason, "RelatedObjectChanged");
}

#[tokio::test]
async fn build_phase_events_carry_recovery_progress() {
    let (n, events) = notifier();
    let k = kit();
    let old = owned_build(&k);
    let mut new = old.clone();
    new.set_phase(BuildPhase::Failed);
    new.status_mut().failure = Some(Failure {
        reason: "exit 1".into(),
        time: None,
        recovery: Recovery { attempt: 1, attempt_max: 5, attempt_time: None },
    });
    n.updated(Some(&old), &new).await;
    let about = events.about("Build", "k");
    assert!(about[0].note.ends_with("(recovery 1 of 5)"), "{}", about[0].note);
}

#[tokio::test]
async fn creator_labels_resolve_the_owner() {
    let (n, events) = notifier();
    let creator = kit();
    let mut b = Build::new("x", BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    b.metadata.labels = Some(Vocabulary::default().creator_labels(&creator));
    let mut new = b.clone();
    new.set_phase(BuildPhase::Scheduling);
    n.updated(Some(&b), &new).await;
    let related = events.about("Kit", "k");
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].reason, "RelatedObjectChanged");
}

#[tokio::test]
async fn condition_changes_are_diffed_by_type() {
    let (n, events) = notifier();
    let mut old = kit();
    old.set_phase(KitPhase::WaitingForPlatform);
    condition::set(old.conditions_mut(), "PlatformAvailable", ConditionStatus::False, "NotReady", "waiting");

    let mut same = old.clone();
    condition::set(same.conditions_mut(), "PlatformAvailable", ConditionStatus::False, "NotReady", "waiting");
    n.updated(Some(&old), &same).await;
    assert!(events.recorded().is_empty());

    let mut flipped = old.clone();
    flipped.set_phase(KitPhase::Initialization);
    condition::set(flipped.conditions_mut(), "PlatformAvailable", ConditionStatus::True, "Ready", "kiln is ready");
    n.updated(Some(&old), &flipped).await;
    assert_eq!(events.reasons(), vec!["KitPhaseUpdated".to_string(), "KitConditionChanged".to_string()]);
    let cond = events.about("Kit", "k").pop().unwrap();
    assert_eq!(cond.kind, EventKind::Normal);
    assert!(cond.note.starts_with("Condition \"PlatformAvailable\" is \"True\""), "{}", cond.note);
}

#[tokio::test]
async fn condition_events_suppressed_without_phase() {
    let (n, events) = notifier();
    let old = kit();
    let mut new = old.clone();
    condition::set(new.conditions_mut(), "Anything", ConditionStatus::True, "", "");
    n.updated(Some(&old), &new).await;
    assert!(events.recorded().is_empty());
}

#[tokio::test]
async fn errors_are_warnings() {
    let (n, events) = notifier();
    n.error(&kit(), "boom").await;
    let recorded = events.about("Kit", "k");
    assert_eq!(recorded[0].kind, EventKind::Warning);
    assert_eq!(recorded[0].reason, "KitError");
    assert_eq!(recorded[0].note, "Cannot reconcile Kit k: boom");
}
