use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};

use super::{Publisher, SinkConnector, SinkError};
use crate::config::Settings;
use crate::monitor::{MqttBackend, SinkConfig};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connects [`MqttPublisher`]s for sink configurations with an `mqttBackend`.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_id_prefix: String,
    connect_timeout: Duration,
    publish_timeout: Duration,
}

impl MqttConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client_id_prefix: settings.client_id_prefix.clone(),
            connect_timeout: settings.connect_timeout(),
            publish_timeout: settings.publish_timeout(),
        }
    }

    fn client_id(&self) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{suffix:08x}", self.client_id_prefix)
    }
}

impl SinkConnector for MqttConnector {
    fn connect<'a>(
        &'a self,
        config: &'a SinkConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Publisher>, SinkError>> {
        Box::pin(async move {
            let backend = config.mqtt_backend.as_ref().ok_or(SinkError::NoBackend)?;
            let publisher = MqttPublisher::connect(
                backend,
                self.client_id(),
                self.connect_timeout,
                self.publish_timeout,
            )
            .await?;
            Ok(Arc::new(publisher) as Arc<dyn Publisher>)
        })
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    publish_timeout: Duration,
}

impl MqttPublisher {
    /// Connects to the broker and waits for its acknowledgement.
    ///
    /// The event loop keeps running in a background task for as long as the client lives.
    pub async fn connect(
        backend: &MqttBackend,
        client_id: String,
        connect_timeout: Duration,
        publish_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let mut options = MqttOptions::new(client_id, backend.host.clone(), backend.port);
        options.set_keep_alive(KEEP_ALIVE);
        if !backend.username.is_empty() || !backend.password.is_empty() {
            options.set_credentials(backend.username.clone(), backend.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let broker = format!("{}:{}", backend.host, backend.port);

        let connected = tokio::time::timeout(connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(SinkError::Connect(err.to_string())),
                }
            }
        })
        .await;
        match connected {
            Ok(result) => result?,
            Err(_) => return Err(SinkError::Timeout),
        }
        log::info!("Connected to MQTT broker {broker}");

        tokio::spawn(drive(eventloop, broker));

        Ok(Self {
            client,
            topic: backend.topic.clone(),
            publish_timeout,
        })
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            let len = payload.len();
            let send = self
                .client
                .publish(self.topic.clone(), QoS::AtMostOnce, false, payload);
            match tokio::time::timeout(self.publish_timeout, send).await {
                Ok(Ok(())) => {
                    log::debug!("Published {len} bytes to {}", self.topic);
                    Ok(())
                }
                Ok(Err(err)) => Err(SinkError::Publish(err.to_string())),
                Err(_) => Err(SinkError::Timeout),
            }
        })
    }
}

async fn drive(mut eventloop: EventLoop, broker: String) {
    let mut connected = true;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !connected {
                    log::info!("Reconnected to MQTT broker {broker}");
                    connected = true;
                }
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => return,
            Err(err) => {
                if connected {
                    log::error!("Connection to MQTT broker {broker} lost: {err}");
                    connected = false;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
