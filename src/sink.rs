//! Message sinks and the registry that shares them between jobs.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::monitor::SinkConfig;

pub mod mqtt;
pub use mqtt::MqttConnector;

/// Publish-only access to a message sink.
pub trait Publisher: Send + Sync {
    /// Sends one encoded message. Best effort; a timeout is an error.
    fn publish(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), SinkError>>;
}

/// Builds a [`Publisher`] from a sink configuration.
pub trait SinkConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a SinkConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Publisher>, SinkError>>;
}

/// Process-wide publisher cache, keyed by the serialized sink configuration.
///
/// Create one per process and share it; entries are never evicted.
pub struct SinkRegistry {
    connector: Box<dyn SinkConnector>,
    publishers: Mutex<HashMap<Vec<u8>, Arc<dyn Publisher>>>,
}

impl SinkRegistry {
    pub fn new(connector: impl SinkConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            publishers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the publisher for `config`, constructing it on first use.
    ///
    /// The registry lock is held while connecting, so concurrent resolutions of one configuration
    /// construct a single publisher. Failures are not cached.
    pub async fn resolve(&self, config: &SinkConfig) -> Result<Arc<dyn Publisher>, SinkError> {
        let key = serde_json::to_vec(config).map_err(SinkError::Config)?;

        let mut publishers = self.publishers.lock().await;
        if let Some(publisher) = publishers.get(&key) {
            log::debug!("Use existing publisher for {}", String::from_utf8_lossy(&key));
            return Ok(Arc::clone(publisher));
        }

        let publisher = self.connector.connect(config).await?;
        publishers.insert(key, Arc::clone(&publisher));
        Ok(publisher)
    }

    pub async fn len(&self) -> usize {
        self.publishers.lock().await.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink configuration has no backend")]
    NoBackend,
    #[error("serialize sink configuration: {0}")]
    Config(#[source] serde_json::Error),
    #[error("connect to broker: {0}")]
    Connect(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("timed out")]
    Timeout,
}
