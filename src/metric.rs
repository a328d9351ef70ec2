//! Periodic metric polling for the entities a job tracks.
//!
//! A [`MetricWorker`] owns a mutable set of queries. Once started, it evaluates every query on a fixed
//! interval and sends one [`MetricResult`] per entity through a bounded channel.
//! A slow receiver delays the next cycle; results are never dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::monitor::PrometheusSource;

pub mod prometheus;
pub use prometheus::{PrometheusClient, PrometheusConnector};

/// Upper bound on queries in flight against one backend during a cycle.
pub const MAX_CONCURRENT_QUERIES: usize = 8;

/// Metric values of one entity, by field name.
pub type Fields = BTreeMap<String, f64>;

/// Instant queries against a time-series backend.
pub trait MetricsBackend: Send + Sync {
    /// Evaluates `expression` at `at`. `None` means the backend has no sample.
    fn query<'a>(
        &'a self,
        expression: &'a str,
        at: SystemTime,
    ) -> BoxFuture<'a, Result<Option<f64>, MetricsError>>;
}

/// Builds a [`MetricsBackend`] for a configured source.
pub trait MetricsConnector: Send + Sync {
    fn connect(&self, source: &PrometheusSource) -> Result<Arc<dyn MetricsBackend>, MetricsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub field: String,
    pub metric: String,
    pub namespace: String,
    pub name: String,
}

impl MetricQuery {
    pub fn expression(&self) -> String {
        render_query(&self.namespace, &self.name, &self.metric)
    }
}

/// `metric{namespace="<ns>",name="<name>"}`; also the key of the query in a worker.
pub fn render_query(namespace: &str, name: &str, metric: &str) -> String {
    format!("{metric}{{namespace=\"{namespace}\",name=\"{name}\"}}")
}

/// All fields polled for one entity in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub namespace: String,
    pub name: String,
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct MetricWorker {
    backend: Arc<dyn MetricsBackend>,
    queries: RwLock<HashMap<String, MetricQuery>>,
    results: mpsc::Sender<MetricResult>,
    jitter: (Duration, Duration),
    state: Mutex<WorkerState>,
    /// Child of the owning job's token.
    token: CancellationToken,
    /// Cancelled once the poll loop has exited.
    stopped: CancellationToken,
}

impl MetricWorker {
    pub fn new(
        parent: &CancellationToken,
        backend: Arc<dyn MetricsBackend>,
        results: mpsc::Sender<MetricResult>,
        jitter: (Duration, Duration),
    ) -> Self {
        Self {
            backend,
            queries: RwLock::new(HashMap::new()),
            results,
            jitter,
            state: Mutex::new(WorkerState::Created),
            token: parent.child_token(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Registers `metric` for the entity `namespace/name`, reported as `field`.
    pub fn add_query(&self, namespace: &str, name: &str, field: &str, metric: &str) {
        let key = render_query(namespace, name, metric);
        self.queries.write().entry(key).or_insert_with(|| MetricQuery {
            field: field.into(),
            metric: metric.into(),
            namespace: namespace.into(),
            name: name.into(),
        });
    }

    pub fn delete_query(&self, namespace: &str, name: &str, metric: &str) {
        self.queries
            .write()
            .remove(&render_query(namespace, name, metric));
    }

    pub fn query_count(&self) -> usize {
        self.queries.read().len()
    }

    /// Spawns the poll loop. Only the first call starts it.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<(), WorkerError> {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Created {
                return Err(WorkerError::AlreadyStarted(*state));
            }
            *state = WorkerState::Running;
        }

        tokio::spawn(Arc::clone(self).run(interval));
        Ok(())
    }

    /// Cancels the poll loop and waits until it has exited.
    ///
    /// Also returns promptly if the loop already exited through parent cancellation,
    /// or if the worker was never started.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Created => {
                    *state = WorkerState::Stopped;
                    self.token.cancel();
                    self.stopped.cancel();
                    return;
                }
                WorkerState::Running => *state = WorkerState::Stopping,
                WorkerState::Stopping | WorkerState::Stopped => {}
            }
        }

        self.token.cancel();
        self.stopped.cancelled().await;
    }

    async fn run(self: Arc<Self>, interval: Duration) {
        let _done = self.stopped.clone().drop_guard();

        tokio::select! {
            _ = tokio::time::sleep(random_delay(self.jitter)) => {}
            _ = self.token.cancelled() => {
                *self.state.lock() = WorkerState::Stopped;
                return;
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        'poll: loop {
            let start = Instant::now();
            let results = tokio::select! {
                results = self.poll_once() => results,
                _ = self.token.cancelled() => break 'poll,
            };
            log::info!(
                "Metric loop once, {} entities, cost {:?}",
                results.len(),
                start.elapsed()
            );

            for result in results {
                tokio::select! {
                    sent = self.results.send(result) => {
                        if sent.is_err() {
                            log::warn!("Metric result receiver is gone, stopping poll loop");
                            break 'poll;
                        }
                    }
                    _ = self.token.cancelled() => break 'poll,
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.token.cancelled() => break 'poll,
            }
        }

        *self.state.lock() = WorkerState::Stopped;
    }

    /// Evaluates every registered query and groups the values by entity.
    async fn poll_once(&self) -> Vec<MetricResult> {
        let queries: Vec<(String, MetricQuery)> = self
            .queries
            .read()
            .iter()
            .map(|(expression, query)| (expression.clone(), query.clone()))
            .collect();

        let at = SystemTime::now();
        let values: Vec<_> = stream::iter(queries)
            .map(|(expression, query)| async move {
                let value = self.backend.query(&expression, at).await;
                (query, expression, value)
            })
            .buffer_unordered(MAX_CONCURRENT_QUERIES)
            .collect()
            .await;

        let mut grouped = BTreeMap::<(String, String), MetricResult>::new();
        for (query, expression, value) in values {
            let value = match value {
                Ok(Some(value)) if value.is_finite() => value,
                Ok(Some(value)) => {
                    log::warn!("Querying {expression} returned {value}, skipped");
                    continue;
                }
                Ok(None) => continue,
                Err(err) => {
                    log::error!("Querying {expression} failed: {err}");
                    continue;
                }
            };
            grouped
                .entry((query.namespace.clone(), query.name.clone()))
                .or_insert_with(|| MetricResult {
                    namespace: query.namespace.clone(),
                    name: query.name.clone(),
                    fields: Fields::new(),
                })
                .fields
                .insert(query.field.clone(), value);
        }
        grouped.into_values().collect()
    }
}

fn random_delay((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let nanos = rand::thread_rng().gen_range(min.as_nanos() as u64..max.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("metric worker cannot be started from state {0:?}")]
    AlreadyStarted(WorkerState),
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("request metrics backend: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics backend returned {error_type}: {error}")]
    Api { error_type: String, error: String },
    #[error("unexpected sample value {0:?}")]
    Value(String),
}
