//! In-memory collaborators, and tests of jobs running against them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube_core::{DynamicObject, ResourceExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::job::{Collaborators, JobError, JobManager};
use crate::metric::{render_query, MetricsBackend, MetricsConnector, MetricsError};
use crate::monitor::{
    Gvk, MonitorSpec, MqttBackend, MsgBuilderSpec, MsgSourceSpec, PrometheusSource, SelectorSpec,
    SinkConfig, Subscription,
};
use crate::sink::{Publisher, SinkConnector, SinkError, SinkRegistry};
use crate::source::{ResourceEvent, ResourceSource, SourceError, StatusWriter};
use crate::subscriber::{Event, QualifiedName};
use crate::{run, Settings};

/// An object of kind `example.com/v1 Widget` in `default`, labelled `app=demo`.
pub(crate) fn object(name: &str, spec: Value) -> DynamicObject {
    resource("example.com/v1", "Widget", "default", name, &[("app", "demo")], spec)
}

fn vmi(namespace: &str, name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    resource(
        "kubevirt.io/v1",
        "VirtualMachineInstance",
        namespace,
        name,
        labels,
        json!({"domain": {"cpu": {"cores": 1}}}),
    )
}

fn resource(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    spec: Value,
) -> DynamicObject {
    let labels: HashMap<_, _> = labels.iter().copied().collect();
    serde_json::from_value(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {"name": name, "namespace": namespace, "labels": labels},
        "spec": spec,
    }))
    .unwrap()
}

/// Records every published message as JSON.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    messages: Mutex<Vec<Value>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn messages(&self) -> Vec<Value> {
        self.messages.lock().clone()
    }

    pub(crate) fn last(&self) -> Value {
        self.messages.lock().last().cloned().expect("nothing published")
    }

    pub(crate) fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Publish("sink unavailable".into()));
            }
            let message = serde_json::from_slice(&payload).expect("publish invalid JSON");
            self.messages.lock().push(message);
            Ok(())
        })
    }
}

/// A metrics backend answering from a table. Expressions absent from the table have no sample.
#[derive(Default)]
pub(crate) struct FakeMetrics {
    values: Mutex<HashMap<String, Option<f64>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeMetrics {
    pub(crate) fn set(&self, expression: &str, value: f64) {
        self.values.lock().insert(expression.into(), Some(value));
    }

    pub(crate) fn fail(&self, expression: &str) {
        self.values.lock().insert(expression.into(), None);
    }

    /// Every query takes `delay` before answering.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The largest number of queries that were answering at once.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl MetricsBackend for FakeMetrics {
    fn query<'a>(
        &'a self,
        expression: &'a str,
        _at: SystemTime,
    ) -> BoxFuture<'a, Result<Option<f64>, MetricsError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(in_flight, Ordering::SeqCst);

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let value = self.values.lock().get(expression).copied();
            match value {
                Some(Some(value)) => Ok(Some(value)),
                Some(None) => Err(MetricsError::Value("fake failure".into())),
                None => Ok(None),
            }
        })
    }
}

struct FakeMetricsConnector(Arc<FakeMetrics>);

impl MetricsConnector for FakeMetricsConnector {
    fn connect(&self, _source: &PrometheusSource) -> Result<Arc<dyn MetricsBackend>, MetricsError> {
        Ok(Arc::clone(&self.0) as Arc<dyn MetricsBackend>)
    }
}

struct FakeSinkConnector {
    publisher: Arc<RecordingPublisher>,
    connects: Arc<AtomicUsize>,
}

impl SinkConnector for FakeSinkConnector {
    fn connect<'a>(
        &'a self,
        config: &'a SinkConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Publisher>, SinkError>> {
        Box::pin(async move {
            config.mqtt_backend.as_ref().ok_or(SinkError::NoBackend)?;
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.publisher) as Arc<dyn Publisher>)
        })
    }
}

/// Objects of every kind, a watch feed per [`watch`](ResourceSource::watch) call,
/// and the status patches written.
#[derive(Default)]
struct FakeCluster {
    objects: Mutex<Vec<DynamicObject>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Result<ResourceEvent, SourceError>>>>,
    patches: Mutex<Vec<(String, String, usize)>>,
}

impl FakeCluster {
    fn emit(&self, event: ResourceEvent) {
        {
            let mut objects = self.objects.lock();
            let same = |a: &DynamicObject, b: &DynamicObject| {
                a.namespace() == b.namespace() && a.name_any() == b.name_any()
            };
            match &event {
                ResourceEvent::Added(object) => objects.push(object.clone()),
                ResourceEvent::Updated { new, .. } => {
                    objects.retain(|o| !same(o, new));
                    objects.push(new.clone());
                }
                ResourceEvent::Deleted(object) => objects.retain(|o| !same(o, object)),
            }
        }

        self.watchers
            .lock()
            .retain(|watcher| watcher.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn last_patch(&self) -> Option<(String, String, usize)> {
        self.patches.lock().last().cloned()
    }
}

impl ResourceSource for FakeCluster {
    fn list<'a>(
        &'a self,
        selector: &'a SelectorSpec,
    ) -> BoxFuture<'a, Result<Vec<DynamicObject>, SourceError>> {
        let objects = self
            .objects
            .lock()
            .iter()
            .filter(|object| selector.matches(object))
            .cloned()
            .collect();
        Box::pin(async move { Ok(objects) })
    }

    fn watch(&self, _gvk: &Gvk) -> BoxStream<'static, Result<ResourceEvent, SourceError>> {
        let (tx, rx) = mpsc::unbounded();
        self.watchers.lock().push(tx);
        rx.boxed()
    }
}

impl StatusWriter for FakeCluster {
    fn patch_status<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        selected: usize,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        self.patches
            .lock()
            .push((namespace.into(), name.into(), selected));
        Box::pin(async { Ok(()) })
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    metrics: Arc<FakeMetrics>,
    publisher: Arc<RecordingPublisher>,
    connects: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self {
            cluster: Arc::default(),
            metrics: Arc::default(),
            publisher: Arc::default(),
            connects: Arc::default(),
        }
    }

    fn manager(&self) -> JobManager {
        let deps = Collaborators {
            resources: Arc::clone(&self.cluster) as Arc<dyn ResourceSource>,
            status: Arc::clone(&self.cluster) as Arc<dyn StatusWriter>,
            metrics: Arc::new(FakeMetricsConnector(Arc::clone(&self.metrics))),
            sinks: SinkRegistry::new(FakeSinkConnector {
                publisher: Arc::clone(&self.publisher),
                connects: Arc::clone(&self.connects),
            }),
            settings: Settings::default(),
        };
        JobManager::new(deps, CancellationToken::new())
    }
}

fn vmi_spec(labels: &[(&str, &str)]) -> MonitorSpec {
    MonitorSpec {
        selector: SelectorSpec {
            gvk: Gvk {
                group: "kubevirt.io".into(),
                version: "v1".into(),
                kind: "VirtualMachineInstance".into(),
            },
            namespace: "default".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
        msg_builder: MsgBuilderSpec {
            msg_source: MsgSourceSpec {
                prometheus_source: Some(PrometheusSource {
                    scheme: "http".into(),
                    host: "prometheus".into(),
                    port: 9090,
                }),
            },
        },
        backend: SinkConfig {
            mqtt_backend: Some(MqttBackend {
                host: "broker".into(),
                port: 1883,
                topic: "gateway".into(),
                username: String::new(),
                password: String::new(),
            }),
        },
    }
}

fn subscription(labels: &[(&str, &str)]) -> Subscription {
    Subscription::new("ops", "vms", vmi_spec(labels))
}

const MEM: &str = "kubevirt_vmi_memory_resident_bytes";
const CPU: &str = "kubevirt_vmi_vcpu_seconds";

/// Lets every spawned task run until it waits on something.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn unchanged_subscription_reuses_job() {
    let harness = Harness::new();
    let manager = harness.manager();

    let first = manager.acquire(&subscription(&[("app", "vm")])).await.unwrap();
    harness
        .cluster
        .emit(ResourceEvent::Added(vmi("default", "vm1", &[("app", "vm")])));
    settle().await;
    let published = first.store().published();

    let second = manager.acquire(&subscription(&[("app", "vm")])).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(!second.is_cancelled());
    assert_eq!(second.store().published(), published);
    assert!(second.store().cached("default", "vm1").await.is_some());
    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    assert_eq!(harness.cluster.watchers.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn changed_subscription_replaces_job() {
    let harness = Harness::new();
    let manager = harness.manager();
    harness.metrics.set(&render_query("default", "vm1", MEM), 1.0);

    let old = manager.acquire(&subscription(&[("app", "vm")])).await.unwrap();
    harness
        .cluster
        .emit(ResourceEvent::Added(vmi("default", "vm1", &[("app", "vm")])));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let old_published = old.store().published();
    assert_eq!(old_published, 3);

    let new = manager.acquire(&subscription(&[("app", "other")])).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(old.is_cancelled());
    assert_eq!(old.worker().state(), crate::metric::WorkerState::Stopped);
    assert_eq!(manager.len().await, 1);
    assert!(Arc::ptr_eq(&manager.get("ops/vms").await.unwrap(), &new));

    harness.metrics.set(&render_query("default", "vm1", MEM), 2.0);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(old.store().published(), old_published);
}

#[tokio::test(start_paused = true)]
async fn release_cancels_job() {
    let harness = Harness::new();
    let manager = harness.manager();

    let job = manager.acquire(&subscription(&[])).await.unwrap();
    manager.release("ops/vms").await;
    manager.release("ops/vms").await;

    assert!(job.is_cancelled());
    assert_eq!(manager.len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn subscription_without_metrics_source_gets_no_job() {
    let harness = Harness::new();
    let manager = harness.manager();

    let old = manager.acquire(&subscription(&[])).await.unwrap();

    let mut broken = subscription(&[]);
    broken.spec.msg_builder = MsgBuilderSpec::default();
    assert!(matches!(
        manager.acquire(&broken).await,
        Err(JobError::MissingMetricsSource)
    ));
    assert!(old.is_cancelled());
    assert_eq!(manager.len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn job_publishes_related_changes_with_metrics() {
    let harness = Harness::new();
    let manager = harness.manager();
    let cluster = &harness.cluster;

    let job = manager.acquire(&subscription(&[("app", "vm")])).await.unwrap();
    assert_eq!(cluster.last_patch(), Some(("ops".into(), "vms".into(), 0)));

    cluster.emit(ResourceEvent::Added(vmi("default", "vm1", &[("app", "vm")])));
    cluster.emit(ResourceEvent::Added(vmi("default", "vm2", &[("app", "vm")])));
    cluster.emit(ResourceEvent::Added(vmi("elsewhere", "vm3", &[("app", "vm")])));
    cluster.emit(ResourceEvent::Added(vmi("default", "vm4", &[("app", "db")])));
    settle().await;

    let ops: Vec<_> = harness
        .publisher
        .messages()
        .iter()
        .map(|m| m["op"].clone())
        .collect();
    assert_eq!(ops, ["RegisterSchema", "New", "New"]);
    assert_eq!(
        harness.publisher.last()["meta"]["schema_id"],
        "kubevirt.io/v1/VirtualMachineInstance"
    );
    assert_eq!(job.worker().query_count(), 4);
    assert_eq!(cluster.last_patch(), Some(("ops".into(), "vms".into(), 2)));

    harness.metrics.set(&render_query("default", "vm1", MEM), 1024.0);
    harness.metrics.set(&render_query("default", "vm1", CPU), 5.0);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let merged = harness.publisher.last();
    assert_eq!(merged["op"], "New");
    assert_eq!(merged["meta"]["name"], "vm1");
    assert_eq!(merged["data"]["extras"], json!({"mem_use": 1024.0, "cpu_sec": 5.0}));
    assert_eq!(harness.publisher.count(), 4);

    // the next cycle sees the same values
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.publisher.count(), 4);

    cluster.emit(ResourceEvent::Deleted(vmi("default", "vm2", &[("app", "vm")])));
    settle().await;
    assert_eq!(harness.publisher.last()["op"], "Delete");
    assert_eq!(harness.publisher.last()["meta"]["name"], "vm2");
    assert_eq!(job.worker().query_count(), 2);
    assert_eq!(cluster.last_patch(), Some(("ops".into(), "vms".into(), 1)));

    cluster.emit(ResourceEvent::Updated {
        old: vmi("default", "vm1", &[("app", "vm")]),
        new: vmi("default", "vm1", &[("app", "gone")]),
    });
    settle().await;
    let update = harness.publisher.last();
    assert_eq!(update["op"], "Update");
    assert_eq!(update["data"]["metadata"]["labels"]["app"], "gone");
    assert_eq!(update["data"]["extras"], json!({"mem_use": 1024.0, "cpu_sec": 5.0}));
    assert_eq!(job.worker().query_count(), 0);
    assert_eq!(cluster.last_patch(), Some(("ops".into(), "vms".into(), 0)));
    assert!(job.store().cached("default", "vm1").await.is_none());

    // its delete is outside the selection and leaves no trace
    cluster.emit(ResourceEvent::Deleted(vmi("default", "vm1", &[("app", "gone")])));
    settle().await;
    assert_eq!(harness.publisher.count(), 6);

    cluster.emit(ResourceEvent::Updated {
        old: vmi("default", "vm4", &[("app", "db")]),
        new: vmi("default", "vm4", &[("app", "db"), ("tier", "2")]),
    });
    settle().await;
    assert_eq!(harness.publisher.count(), 6);
}

#[tokio::test(start_paused = true)]
async fn cancelled_job_stops_publishing() {
    let harness = Harness::new();
    let manager = harness.manager();
    harness.metrics.set(&render_query("default", "vm1", MEM), 1.0);

    let job = manager.acquire(&subscription(&[("app", "vm")])).await.unwrap();
    harness
        .cluster
        .emit(ResourceEvent::Added(vmi("default", "vm1", &[("app", "vm")])));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let published = harness.publisher.count();

    job.cancel().await;
    assert_eq!(job.worker().state(), crate::metric::WorkerState::Stopped);

    harness.metrics.set(&render_query("default", "vm1", MEM), 2.0);
    harness
        .cluster
        .emit(ResourceEvent::Added(vmi("default", "vm5", &[("app", "vm")])));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.publisher.count(), published);
}

fn monitor_event(spec: Value, exists: bool) -> Event<QualifiedName, DynamicObject> {
    let entry: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "monitor.fusion-app.io/v1alpha1",
        "kind": "ResourceMonitor",
        "metadata": {"name": "vms", "namespace": "ops"},
        "spec": spec,
    }))
    .unwrap();
    Event {
        key: QualifiedName::from_resource(&entry),
        entry,
        exists,
    }
}

#[tokio::test(start_paused = true)]
async fn runner_follows_monitor_lifecycle() {
    let harness = Harness::new();
    let manager = harness.manager();
    let spec = serde_json::to_value(vmi_spec(&[("app", "vm")])).unwrap();

    let events = stream::iter(vec![
        Ok::<_, std::convert::Infallible>(monitor_event(spec.clone(), true)),
        Ok(monitor_event(spec.clone(), true)),
    ]);
    run(&manager, events).await;
    let job = manager.get("ops/vms").await.unwrap();
    assert_eq!(harness.cluster.watchers.lock().len(), 1);

    let events = stream::iter(vec![
        Ok::<_, std::convert::Infallible>(monitor_event(json!({"selector": 1}), true)),
        Ok(monitor_event(spec, false)),
    ]);
    run(&manager, events).await;
    assert!(job.is_cancelled());
    assert_eq!(manager.len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn runner_survives_stream_errors() {
    let harness = Harness::new();
    let manager = harness.manager();
    let spec = serde_json::to_value(vmi_spec(&[("app", "vm")])).unwrap();

    let events = stream::iter(vec![
        Err("410 Gone"),
        Ok(monitor_event(spec.clone(), true)),
        Err("connection reset"),
        Ok(monitor_event(spec, false)),
    ]);
    run(&manager, events).await;
    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.len().await, 0);
}
