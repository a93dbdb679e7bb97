//! Label and annotation keys, derived from one domain prefix.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};

use crate::GROUP;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    domain: String,
}

impl Default for Vocabulary {
    fn default() -> Self { Self::new(GROUP) }
}

impl Vocabulary {
    pub fn new(domain: impl Into<String>) -> Self { Self { domain: domain.into() } }

    pub fn domain(&self) -> &str { &self.domain }

    fn key(&self, suffix: &str) -> String { format!("{}/{}", self.domain, suffix) }

    pub fn operator_id(&self) -> String { self.key("operator.id") }
    pub fn platform_selector(&self) -> String { self.key("platform") }
    pub fn profile_selector(&self) -> String { self.key("profile") }
    pub fn secondary_platform(&self) -> String { self.key("secondary") }
    pub fn created_by_kind(&self) -> String { self.key("created.by.kind") }
    pub fn created_by_name(&self) -> String { self.key("created.by.name") }
    pub fn created_by_namespace(&self) -> String { self.key("created.by.namespace") }
    pub fn created_by_version(&self) -> String { self.key("created.by.version") }
    pub fn kit_label(&self) -> String { self.key("kit") }
    pub fn build_label(&self) -> String { self.key("build") }
    pub fn image_digest(&self) -> String { self.key("image.digest") }

    /// Value of one of our annotations, empty strings treated as unset.
    pub fn annotation<'a, K: Resource>(&self, obj: &'a K, key: &str) -> Option<&'a str> {
        obj.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn operator_id_of<'a, K: Resource>(&self, obj: &'a K) -> Option<&'a str> {
        self.annotation(obj, &self.operator_id())
    }

    pub fn platform_of<'a, K: Resource>(&self, obj: &'a K) -> Option<&'a str> {
        self.annotation(obj, &self.platform_selector())
    }

    pub fn profile_of<'a, K: Resource>(&self, obj: &'a K) -> Option<&'a str> {
        self.annotation(obj, &self.profile_selector())
    }

    pub fn is_secondary<K: Resource>(&self, obj: &K) -> bool {
        self.annotation(obj, &self.secondary_platform()) == Some("true")
    }

    /// Labels recording that `creator` made an object.
    pub fn creator_labels<K: Resource<DynamicType = ()>>(&self, creator: &K) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(self.created_by_kind(), K::kind(&()).to_string());
        labels.insert(self.created_by_name(), creator.name_any());
        if let Some(ns) = creator.namespace() {
            labels.insert(self.created_by_namespace(), ns);
        }
        labels.insert(self.created_by_version(), K::api_version(&()).to_string());
        labels
    }
}
