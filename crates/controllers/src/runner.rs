//! Build runners: where the actual image build happens.
//!
//! The default runner materialises every attempt of a build as a batch Job
//! owned by the Build, running the platform's builder image.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::{Artifact, Build, Vocabulary};
use kiln_store::Store;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub image: String,
    pub base_image: Option<String>,
    pub image_digest: Option<String>,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Succeeded(RunResult),
    Failed(String),
    /// The runner has no trace of the build.
    Lost,
}

#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn submit(&self, store: &Store, build: &Build) -> anyhow::Result<()>;
    async fn poll(&self, store: &Store, build: &Build) -> anyhow::Result<RunState>;
    async fn cancel(&self, store: &Store, build: &Build) -> anyhow::Result<()>;
    /// Builds of `ns` currently holding a runner slot.
    async fn active(&self, store: &Store, ns: &str) -> anyhow::Result<Vec<String>>;
}

pub const BUILDER_CONTAINER: &str = "builder";

pub struct JobRunner {
    vocabulary: Arc<Vocabulary>,
}

impl JobRunner {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self { Self { vocabulary } }

    /// One job per recovery attempt so a retry never races the deletion of its predecessor.
    pub fn job_name(build: &Build) -> String { format!("{}-builder-{}", build.name_any(), build.recovery_attempt()) }

    pub fn compose(&self, build: &Build) -> anyhow::Result<Job> {
        let owner = build
            .controller_owner_ref(&())
            .ok_or_else(|| anyhow::anyhow!("build {} has no uid", build.name_any()))?;
        let name = build.name_any();
        let ns = build.namespace().unwrap_or_default();
        let spec = &build.spec;

        let mut labels = BTreeMap::new();
        labels.insert(self.vocabulary.build_label(), name.clone());
        labels.extend(self.vocabulary.creator_labels(build));

        let env = vec![
            EnvVar { name: "KILN_BUILD_IMAGE".into(), value: Some(spec.image.clone()), ..Default::default() },
            EnvVar { name: "KILN_BASE_IMAGE".into(), value: Some(spec.base_image.clone()), ..Default::default() },
            EnvVar { name: "KILN_DEPENDENCIES".into(), value: Some(spec.dependencies.join(",")), ..Default::default() },
            EnvVar { name: "KILN_BUILD_STEPS".into(), value: Some(spec.steps.join(",")), ..Default::default() },
            EnvVar {
                name: "KILN_REGISTRY_INSECURE".into(),
                value: Some(spec.platform.insecure.to_string()),
                ..Default::default()
            },
        ];
        let mut args = vec!["build".to_string(), "--build-name".to_string(), name.clone(), "--namespace".to_string(), ns.clone()];
        if let Some(dir) = &spec.build_dir {
            args.push("--build-dir".into());
            args.push(dir.clone());
        }

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(Self::job_name(build)),
                namespace: Some(ns),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                active_deadline_seconds: i64::try_from(spec.timeout_seconds).ok().filter(|t| *t > 0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".into()),
                        containers: vec![Container {
                            name: BUILDER_CONTAINER.into(),
                            image: Some(spec.platform.builder_image.clone()),
                            args: Some(args),
                            env: Some(env),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }
}

fn finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .map(|s| s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0)
        .unwrap_or(false)
}

#[async_trait]
impl BuildRunner for JobRunner {
    async fn submit(&self, store: &Store, build: &Build) -> anyhow::Result<()> {
        let job = self.compose(build)?;
        let ns = build.namespace().unwrap_or_default();
        let name = job.name_any();
        if store.delete::<Job>(&ns, &name).await? {
            debug!(job = %name, "replaced leftover job");
        }
        store.create(&job).await?;
        info!(build = %build.name_any(), job = %name, "build job submitted");
        Ok(())
    }

    async fn poll(&self, store: &Store, build: &Build) -> anyhow::Result<RunState> {
        let ns = build.namespace().unwrap_or_default();
        let Some(job) = store.get::<Job>(&ns, &Self::job_name(build)).await? else {
            return Ok(RunState::Lost);
        };
        let status = job.status.clone().unwrap_or_default();
        if status.succeeded.unwrap_or(0) > 0 {
            let image_digest = self.vocabulary.annotation(&job, &self.vocabulary.image_digest()).map(str::to_string);
            return Ok(RunState::Succeeded(RunResult {
                image: build.spec.image.clone(),
                base_image: Some(build.spec.base_image.clone()),
                image_digest,
                artifacts: Vec::new(),
            }));
        }
        if status.failed.unwrap_or(0) > 0 {
            let reason = status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .find(|c| c.type_ == "Failed")
                .and_then(|c| c.message.or(c.reason))
                .unwrap_or_else(|| "builder job failed".to_string());
            return Ok(RunState::Failed(reason));
        }
        if status.active.unwrap_or(0) > 0 {
            return Ok(RunState::Running);
        }
        Ok(RunState::Pending)
    }

    async fn cancel(&self, store: &Store, build: &Build) -> anyhow::Result<()> {
        let ns = build.namespace().unwrap_or_default();
        store.delete::<Job>(&ns, &Self::job_name(build)).await?;
        Ok(())
    }

    async fn active(&self, store: &Store, ns: &str) -> anyhow::Result<Vec<String>> {
        let key = self.vocabulary.build_label();
        let jobs = store.list::<Job>(Some(ns)).await?;
        Ok(jobs
            .into_iter()
            .filter(|j| !finished(j))
            .filter_map(|j| j.labels().get(&key).cloned())
            .collect())
    }
}
