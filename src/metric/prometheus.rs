use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use serde::Deserialize;

use super::{MetricsBackend, MetricsConnector, MetricsError};
use crate::monitor::PrometheusSource;

/// Prometheus HTTP API client for instant queries.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    http: reqwest::Client,
    address: String,
}

impl PrometheusClient {
    pub fn new(source: &PrometheusSource, timeout: Duration) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            address: source.address(),
        })
    }

    async fn instant_query(
        &self,
        expression: &str,
        at: SystemTime,
    ) -> Result<Option<f64>, MetricsError> {
        let time = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            .to_string();
        let response: QueryResponse = self
            .http
            .get(format!("{}/api/v1/query", self.address))
            .query(&[("query", expression), ("time", time.as_str())])
            .send()
            .await?
            .json()
            .await?;

        if !response.warnings.is_empty() {
            log::info!("Querying {expression} warned: {:?}", response.warnings);
        }
        if response.status != "success" {
            return Err(MetricsError::Api {
                error_type: response.error_type.unwrap_or_default(),
                error: response.error.unwrap_or_default(),
            });
        }

        match response.data {
            Some(QueryData::Vector(samples)) => match samples.first() {
                Some(sample) => parse_value(&sample.value.1),
                None => Ok(None),
            },
            Some(QueryData::Scalar((_, value))) => parse_value(&value),
            Some(QueryData::Matrix(_)) | Some(QueryData::String(_)) | None => Ok(None),
        }
    }
}

impl MetricsBackend for PrometheusClient {
    fn query<'a>(
        &'a self,
        expression: &'a str,
        at: SystemTime,
    ) -> BoxFuture<'a, Result<Option<f64>, MetricsError>> {
        Box::pin(self.instant_query(expression, at))
    }
}

/// `NaN` and infinite samples count as no sample.
fn parse_value(value: &str) -> Result<Option<f64>, MetricsError> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| MetricsError::Value(value.to_owned()))?;
    Ok(parsed.is_finite().then_some(parsed))
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<Sample>),
    Scalar((f64, String)),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Deserialize)]
struct Sample {
    value: (f64, String),
}

/// Connects a [`PrometheusClient`] per source.
#[derive(Debug, Clone)]
pub struct PrometheusConnector {
    timeout: Duration,
}

impl PrometheusConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PrometheusConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl MetricsConnector for PrometheusConnector {
    fn connect(&self, source: &PrometheusSource) -> Result<Arc<dyn MetricsBackend>, MetricsError> {
        Ok(Arc::new(PrometheusClient::new(source, self.timeout)?))
    }
}
