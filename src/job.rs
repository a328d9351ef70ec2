//! One running pipeline per subscription.
//!
//! A [`MonitorJob`] watches the selected kind, forwards related changes to its [`MessageStore`],
//! keeps metric queries registered for tracked entities, and drains metric results into the same store.
//! Cancelling the job tears all of this down.

use std::future::Future;
use std::mem;
use std::panic;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube_client::Client;
use kube_core::{DynamicObject, GroupVersionKind, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MetricRule, Settings};
use crate::message::MessageStore;
use crate::metric::{MetricResult, MetricWorker, MetricsConnector, MetricsError, PrometheusConnector};
use crate::monitor::{MonitorSpec, Subscription};
use crate::sink::{MqttConnector, SinkError, SinkRegistry};
use crate::source::{
    KubeResources, KubeStatusWriter, ResourceEvent, ResourceSource, SourceError, StatusWriter,
};

mod manager;
pub use manager::JobManager;

/// Everything a job needs from outside, shared by all jobs of a process.
pub struct Collaborators {
    pub resources: Arc<dyn ResourceSource>,
    pub status: Arc<dyn StatusWriter>,
    pub metrics: Arc<dyn MetricsConnector>,
    pub sinks: SinkRegistry,
    pub settings: Settings,
}

impl Collaborators {
    /// Wires the apiserver, Prometheus and MQTT implementations.
    ///
    /// `monitor` is the kind whose objects carry the subscriptions.
    pub fn kube(client: Client, monitor: &GroupVersionKind, settings: Settings) -> Self {
        Self {
            resources: Arc::new(KubeResources::new(client.clone())),
            status: Arc::new(KubeStatusWriter::new(client, monitor)),
            metrics: Arc::new(PrometheusConnector::default()),
            sinks: SinkRegistry::new(MqttConnector::new(&settings)),
            settings,
        }
    }
}

pub struct MonitorJob {
    pipeline: Arc<Pipeline>,
    token: CancellationToken,
    results: Mutex<Option<mpsc::Receiver<MetricResult>>>,
    tasks: Mutex<Vec<CancellableTask<()>>>,
}

/// The parts of a job its tasks share.
struct Pipeline {
    subscription: Subscription,
    worker: Arc<MetricWorker>,
    store: Arc<MessageStore>,
    deps: Arc<Collaborators>,
}

impl MonitorJob {
    /// Builds a job under `parent`, resolving its metrics backend and sink.
    ///
    /// Nothing runs until [`start`](Self::start).
    pub async fn new(
        subscription: Subscription,
        deps: Arc<Collaborators>,
        parent: &CancellationToken,
    ) -> Result<Self, JobError> {
        let source = subscription
            .spec
            .msg_builder
            .msg_source
            .prometheus_source
            .as_ref()
            .ok_or(JobError::MissingMetricsSource)?;
        let backend = deps.metrics.connect(source)?;
        let publisher = deps.sinks.resolve(&subscription.spec.backend).await?;

        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(1);
        let worker = MetricWorker::new(&token, backend, tx, deps.settings.jitter());

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                subscription,
                worker: Arc::new(worker),
                store: Arc::new(MessageStore::new(publisher)),
                deps,
            }),
            token,
            results: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscription(&self) -> &Subscription {
        &self.pipeline.subscription
    }

    pub fn spec(&self) -> &MonitorSpec {
        &self.pipeline.subscription.spec
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.pipeline.store
    }

    pub fn worker(&self) -> &Arc<MetricWorker> {
        &self.pipeline.worker
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Publishes the initial status, then starts watching and polling.
    pub async fn start(&self) {
        let Some(results) = self.results.lock().take() else {
            log::warn!("Job {} already started", self.pipeline.subscription.key());
            return;
        };

        self.pipeline.update_resource_status().await;

        let events = self
            .pipeline
            .deps
            .resources
            .watch(&self.pipeline.subscription.spec.selector.gvk);
        let watch = self.spawn(Arc::clone(&self.pipeline).handle_events(events, self.token.clone()));
        let drain = self.spawn(Arc::clone(&self.pipeline).drain_metrics(results, self.token.clone()));
        self.tasks.lock().extend([watch, drain]);

        if let Err(err) = self
            .pipeline
            .worker
            .start(self.pipeline.deps.settings.poll_interval())
        {
            log::error!("Start metric worker failed: {err}");
        }
    }

    /// Stops the poll loop, then cancels event handling and waits for it to finish.
    pub async fn cancel(&self) {
        self.pipeline.worker.stop().await;
        self.token.cancel();

        let tasks = mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.cancel().await;
        }
    }

    fn spawn(
        &self,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> CancellableTask<()> {
        CancellableTask {
            join_handle: tokio::spawn(fut),
            token: self.token.clone(),
        }
    }
}

impl Pipeline {
    fn is_related(&self, object: &DynamicObject) -> bool {
        self.subscription.spec.selector.matches(object)
    }

    async fn handle_events(
        self: Arc<Self>,
        mut events: BoxStream<'static, Result<ResourceEvent, SourceError>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = cancel.cancelled() => return,
            };
            match event {
                Some(Ok(event)) => self.handle(event).await,
                Some(Err(err)) => log::warn!("Watch {} failed: {err}", self.subscription.key()),
                None => {
                    log::warn!("Watch {} ended", self.subscription.key());
                    return;
                }
            }
        }
    }

    async fn handle(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Added(object) => {
                if !self.is_related(&object) {
                    return;
                }
                self.store.on_resource_add(&object).await;
                self.add_queries(&object);
                self.update_resource_status().await;
            }
            ResourceEvent::Updated { old, new } => {
                let (was, is) = (self.is_related(&old), self.is_related(&new));
                if !was && !is {
                    return;
                }
                self.store.on_resource_update(&new).await;
                if was != is {
                    if is {
                        self.add_queries(&new);
                    } else {
                        self.delete_queries(&old);
                        self.store.forget(&new).await;
                    }
                    self.update_resource_status().await;
                }
            }
            ResourceEvent::Deleted(object) => {
                if !self.is_related(&object) {
                    return;
                }
                self.delete_queries(&object);
                self.store.on_resource_delete(&object).await;
                self.update_resource_status().await;
            }
        }
    }

    async fn drain_metrics(
        self: Arc<Self>,
        mut results: mpsc::Receiver<MetricResult>,
        cancel: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                result = results.recv() => result,
                _ = cancel.cancelled() => return,
            };
            match result {
                Some(result) => self.store.on_metric_update(result).await,
                None => return,
            }
        }
    }

    fn add_queries(&self, object: &DynamicObject) {
        let (namespace, name) = (object.namespace().unwrap_or_default(), object.name_any());
        for rule in self.metric_rules() {
            self.worker.add_query(&namespace, &name, &rule.field, &rule.metric);
        }
    }

    fn delete_queries(&self, object: &DynamicObject) {
        let (namespace, name) = (object.namespace().unwrap_or_default(), object.name_any());
        for rule in self.metric_rules() {
            self.worker.delete_query(&namespace, &name, &rule.metric);
        }
    }

    fn metric_rules(&self) -> impl Iterator<Item = &MetricRule> {
        self.deps
            .settings
            .rules_for(&self.subscription.spec.selector.gvk.kind)
    }

    /// Writes the number of currently selected objects into the monitor status.
    async fn update_resource_status(&self) {
        let selector = &self.subscription.spec.selector;
        let objects = match self.deps.resources.list(selector).await {
            Ok(objects) => objects,
            Err(err) => {
                log::error!("List interest resources failed: {err}");
                return;
            }
        };

        if let Err(err) = self
            .deps
            .status
            .patch_status(
                &self.subscription.namespace,
                &self.subscription.name,
                objects.len(),
            )
            .await
        {
            log::error!("Update monitor status of {} failed: {err}", self.subscription.key());
        }
    }
}

struct CancellableTask<T> {
    join_handle: JoinHandle<T>,
    token: CancellationToken,
}

impl<T> CancellableTask<T> {
    async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.join_handle.await {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("monitor spec has no metrics source")]
    MissingMetricsSource,
    #[error("connect metrics backend: {0}")]
    Metrics(#[from] MetricsError),
    #[error("resolve message sink: {0}")]
    Sink(#[from] SinkError),
}
