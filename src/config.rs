//! Runtime tuning shared by every job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters for [`JobManager`](crate::JobManager) and the collaborators it builds.
///
/// Every field has a default, so an empty document deserializes to [`Settings::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Interval between two metric poll cycles.
    pub poll_interval_ms: u64,
    /// Lower bound of the random delay before the first poll cycle.
    pub jitter_min_ms: u64,
    /// Upper bound (exclusive) of the random delay before the first poll cycle.
    pub jitter_max_ms: u64,
    /// How long a single publish may take before it counts as failed.
    pub publish_timeout_ms: u64,
    /// How long constructing a publisher may wait for its broker.
    pub connect_timeout_ms: u64,
    /// MQTT client ids are `{prefix}-{random}`.
    pub client_id_prefix: String,
    /// Kinds that carry metrics, and which metrics to poll for them.
    pub metric_rules: Vec<MetricRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20_000,
            jitter_min_ms: 100,
            jitter_max_ms: 500,
            publish_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
            client_id_prefix: "k8s-gateway".into(),
            metric_rules: MetricRule::kubevirt(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn jitter(&self) -> (Duration, Duration) {
        let min = Duration::from_millis(self.jitter_min_ms);
        let max = Duration::from_millis(self.jitter_max_ms.max(self.jitter_min_ms));
        (min, max)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The metric rules that apply to objects of `kind`.
    pub fn rules_for<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a MetricRule> + 'a {
        self.metric_rules.iter().filter(move |rule| rule.kind == kind)
    }
}

/// Poll `metric` for every tracked object of `kind`, and report it as `field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRule {
    pub kind: String,
    pub field: String,
    pub metric: String,
}

impl MetricRule {
    pub fn new(kind: &str, field: &str, metric: &str) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            metric: metric.into(),
        }
    }

    /// Memory and vCPU usage of KubeVirt virtual machine instances.
    pub fn kubevirt() -> Vec<Self> {
        vec![
            Self::new(
                "VirtualMachineInstance",
                "mem_use",
                "kubevirt_vmi_memory_resident_bytes",
            ),
            Self::new(
                "VirtualMachineInstance",
                "cpu_sec",
                "kubevirt_vmi_vcpu_seconds",
            ),
        ]
    }
}
