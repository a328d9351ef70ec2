//! The monitoring intent a job is built from.
//!
//! [`MonitorSpec`] mirrors the `spec` of a ResourceMonitor object.
//! Two specs are the same configuration iff they are structurally equal;
//! the job manager relies on this to decide whether a running job can be reused.

use std::collections::BTreeMap;

use kube_core::{DynamicObject, GroupVersionKind, ResourceExt};
use serde::{Deserialize, Serialize};

/// A subscription captured from a ResourceMonitor object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Namespace of the owning monitor object.
    pub namespace: String,
    /// Name of the owning monitor object.
    pub name: String,
    pub spec: MonitorSpec,
}

impl Subscription {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: MonitorSpec) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec,
        }
    }

    /// The identity of this subscription, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Reads the subscription from a ResourceMonitor object.
    pub fn from_object(object: &DynamicObject) -> Result<Self, SpecError> {
        let spec = object.data.get("spec").ok_or(SpecError::MissingSpec)?;
        let spec = MonitorSpec::deserialize(spec).map_err(SpecError::Invalid)?;
        Ok(Self::new(
            object.namespace().unwrap_or_default(),
            object.name_any(),
            spec,
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("monitor object has no spec")]
    MissingSpec,
    #[error("invalid monitor spec: {0}")]
    Invalid(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub selector: SelectorSpec,
    #[serde(default)]
    pub msg_builder: MsgBuilderSpec,
    #[serde(flatten)]
    pub backend: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSpec {
    pub gvk: Gvk,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl SelectorSpec {
    /// Whether `object` is in scope of this selector.
    ///
    /// The namespace must match exactly, and every selector label must be present with the same value.
    /// An object without any labels never matches.
    pub fn matches(&self, object: &DynamicObject) -> bool {
        object.namespace().unwrap_or_default() == self.namespace
            && matches_labels(object.labels(), &self.labels)
    }

    /// Renders the labels as a Kubernetes label selector, e.g. `app=web,tier=db`.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn matches_labels(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    if labels.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(key, expected)| labels.get(key) == Some(expected))
}

/// Group, version and kind of the watched resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn to_kube(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgBuilderSpec {
    #[serde(default)]
    pub msg_source: MsgSourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_source: Option<PrometheusSource>,
}

/// Where the metrics backend is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusSource {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl PrometheusSource {
    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_scheme() -> String {
    "http".into()
}

/// Message sink configuration. Its serialized form is the identity of a publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_backend: Option<MqttBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttBackend {
    pub host: String,
    pub port: u16,
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}
