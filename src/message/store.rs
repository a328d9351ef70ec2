use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kube_core::{DynamicObject, ResourceExt};
use serde::Serialize;
use tokio::sync::Mutex;

use super::{schema, CodecError, Message, ResourceMeta, ResourceOp};
use crate::metric::{Fields, MetricResult};
use crate::sink::Publisher;

/// The last message published for an entity, and the metric fields merged into it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub message: Message,
    pub metrics: Fields,
}

/// Turns resource events and metric results into deduplicated messages.
///
/// All entry points serialize on one lock, which is also held while publishing,
/// so messages for one entity reach the sink in the order they were decided.
pub struct MessageStore {
    publisher: Arc<dyn Publisher>,
    inner: Mutex<Inner>,
    published: AtomicU64,
}

#[derive(Default)]
struct Inner {
    /// Fixed by the first successful schema registration.
    schema_id: Option<String>,
    cache: HashMap<EntityKey, CachedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntityKey {
    namespace: String,
    name: String,
}

impl EntityKey {
    fn of(object: &DynamicObject) -> Self {
        Self {
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
        }
    }
}

impl Inner {
    fn meta(&self, key: &EntityKey) -> ResourceMeta {
        ResourceMeta {
            schema_id: self.schema_id.clone().unwrap_or_default(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }
}

impl MessageStore {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            inner: Mutex::new(Inner::default()),
            published: AtomicU64::new(0),
        }
    }

    pub async fn schema_id(&self) -> Option<String> {
        self.inner.lock().await.schema_id.clone()
    }

    /// The number of messages the sink accepted.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// A copy of the cache entry for `namespace/name`.
    pub async fn cached(&self, namespace: &str, name: &str) -> Option<CachedMessage> {
        let key = EntityKey {
            namespace: namespace.into(),
            name: name.into(),
        };
        self.inner.lock().await.cache.get(&key).cloned()
    }

    pub async fn on_resource_add(&self, object: &DynamicObject) {
        let mut inner = self.inner.lock().await;
        if !self.ensure_schema(&mut inner, object).await {
            return;
        }

        let Some(data) = encode_object(object) else {
            return;
        };
        let key = EntityKey::of(object);
        let message = Message::resource(ResourceOp::New, inner.meta(&key), data);

        let metrics = match inner.cache.get(&key) {
            Some(cached) if cached.message.same_as(&message) => return,
            Some(cached) => cached.metrics.clone(),
            None => Fields::new(),
        };
        inner.cache.insert(
            key,
            CachedMessage {
                message: message.clone(),
                metrics: metrics.clone(),
            },
        );
        self.publish(&message, &metrics).await;
    }

    pub async fn on_resource_update(&self, object: &DynamicObject) {
        let mut inner = self.inner.lock().await;
        if !self.ensure_schema(&mut inner, object).await {
            return;
        }

        let Some(data) = encode_object(object) else {
            return;
        };
        let key = EntityKey::of(object);
        let message = Message::resource(ResourceOp::Update, inner.meta(&key), data);

        match inner.cache.get_mut(&key) {
            Some(cached) => {
                if cached.message.same_as(&message) {
                    return;
                }
                cached.message = message.clone();
                let metrics = cached.metrics.clone();
                self.publish(&message, &metrics).await;
            }
            None => {
                inner.cache.insert(
                    key,
                    CachedMessage {
                        message: message.clone(),
                        metrics: Fields::new(),
                    },
                );
                self.publish(&message, &Fields::new()).await;
            }
        }
    }

    /// Merges `result` into the entity's last message. Non-finite values are ignored.
    pub async fn on_metric_update(&self, mut result: MetricResult) {
        result.fields.retain(|_, value| value.is_finite());

        let mut inner = self.inner.lock().await;
        let key = EntityKey {
            namespace: result.namespace,
            name: result.name,
        };

        let message = match inner.cache.get_mut(&key) {
            Some(cached) => {
                if cached.metrics == result.fields {
                    return;
                }
                cached.metrics = result.fields.clone();
                cached.message.clone()
            }
            None => {
                let message = Message::resource(ResourceOp::Update, inner.meta(&key), Vec::new());
                inner.cache.insert(
                    key,
                    CachedMessage {
                        message: message.clone(),
                        metrics: result.fields.clone(),
                    },
                );
                message
            }
        };
        self.publish(&message, &result.fields).await;
    }

    /// Publishes a delete for `object` and evicts its cache entry. Deletes are never deduplicated.
    pub async fn on_resource_delete(&self, object: &DynamicObject) {
        let mut inner = self.inner.lock().await;
        let key = EntityKey::of(object);
        inner.cache.remove(&key);

        let Some(data) = encode_json(&object.metadata, &key) else {
            return;
        };
        let message = Message::resource(ResourceOp::Delete, inner.meta(&key), data);
        self.publish(&message, &Fields::new()).await;
    }

    /// Evicts the cache entry of `object` without publishing anything.
    ///
    /// For entities that left the selection: their later delete is not seen by the store.
    pub async fn forget(&self, object: &DynamicObject) {
        let key = EntityKey::of(object);
        if self.inner.lock().await.cache.remove(&key).is_some() {
            log::debug!("Forgot {}/{}", key.namespace, key.name);
        }
    }

    /// Registers the schema of `object` unless one is registered already.
    ///
    /// Returns whether a schema id is available. A failed registration is retried with the next object.
    async fn ensure_schema(&self, inner: &mut Inner, object: &DynamicObject) -> bool {
        if inner.schema_id.is_some() {
            return true;
        }

        let payload = match serde_json::to_value(object) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("Serialize object for JSON schema failed: {err}");
                return false;
            }
        };
        let schema = match serde_json::to_vec(&schema::document(&payload)) {
            Ok(schema) => schema,
            Err(err) => {
                log::error!("Serialize JSON schema failed: {err}");
                return false;
            }
        };

        let encoded = match Message::register_schema(schema).encode(&Fields::new()) {
            Ok(encoded) => encoded,
            Err(err) => {
                log::error!("Serialize schema message failed: {err}");
                return false;
            }
        };
        if let Err(err) = self.publisher.publish(encoded).await {
            log::error!("Register JSON schema failed: {err}");
            return false;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let schema_id = schema::schema_id(object);
        log::info!("Registered JSON schema {schema_id}");
        inner.schema_id = Some(schema_id);
        true
    }

    async fn publish(&self, message: &Message, extras: &Fields) {
        let encoded = match message.encode(extras) {
            Ok(encoded) => encoded,
            Err(err) => {
                log_codec_error(message, &err);
                return;
            }
        };
        match self.publisher.publish(encoded).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => log::warn!("Publish {:?} message failed: {err}", message.op),
        }
    }
}

fn encode_object(object: &DynamicObject) -> Option<Vec<u8>> {
    encode_json(object, &EntityKey::of(object))
}

fn encode_json<T: Serialize>(value: &T, key: &EntityKey) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(data) => Some(data),
        Err(err) => {
            log::error!("Build message for {}/{} failed: {err}", key.namespace, key.name);
            None
        }
    }
}

fn log_codec_error(message: &Message, err: &CodecError) {
    match &message.meta {
        Some(meta) => log::error!(
            "Serialize {:?} message for {}/{} failed: {err}",
            message.op,
            meta.namespace,
            meta.name
        ),
        None => log::error!("Serialize {:?} message failed: {err}", message.op),
    }
}
