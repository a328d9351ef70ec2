//! Subscription events from ResourceMonitor objects.

use std::fmt;

use futures::{stream, Stream, StreamExt, TryStreamExt};
use kube_client::{Api, Client};
use kube_core::{ApiResource, DynamicObject, GroupVersionKind, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};

use crate::monitor::{SpecError, Subscription};
use crate::source::{Informer, ResourceEvent};

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.name_any(),
        }
    }
}

/// Formats as `namespace/name`, the same form as [`Subscription::key`].
impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.namespace.as_deref().unwrap_or_default(),
            self.name
        )
    }
}

pub struct Event<Key, Entry> {
    pub key: Key,
    pub entry: Entry,
    /// Whether the object still exists after this event.
    pub exists: bool,
}

impl Event<QualifiedName, DynamicObject> {
    /// Whether the monitor should have a running job: it exists and is not being deleted.
    pub fn is_live(&self) -> bool {
        self.exists && self.entry.meta().deletion_timestamp.is_none()
    }

    pub fn subscription(&self) -> Result<Subscription, SpecError> {
        Subscription::from_object(&self.entry)
    }
}

impl From<ResourceEvent> for Event<QualifiedName, DynamicObject> {
    fn from(event: ResourceEvent) -> Self {
        let (entry, exists) = match event {
            ResourceEvent::Added(object) | ResourceEvent::Updated { new: object, .. } => {
                (object, true)
            }
            ResourceEvent::Deleted(object) => (object, false),
        };
        Event {
            key: QualifiedName::from_resource(&entry),
            entry,
            exists,
        }
    }
}

/// Watches monitor objects of kind `monitor` in all namespaces.
///
/// Watch errors are yielded and followed by a backoff, so the stream only ends with the watcher.
/// After a relist, monitors that disappeared meanwhile are reported as gone.
pub fn monitors(
    client: Client,
    monitor: &GroupVersionKind,
    watcher_config: watcher::Config,
) -> impl Stream<Item = Result<Event<QualifiedName, DynamicObject>, watcher::Error>> {
    let resource = ApiResource::from_gvk(monitor);
    let api = Api::<DynamicObject>::all_with(client, &resource);
    let mut informer = Informer::default();

    watcher(api, watcher_config)
        .default_backoff()
        .map_ok(move |event| {
            stream::iter(
                informer
                    .apply(event)
                    .into_iter()
                    .map(|event| Ok::<_, watcher::Error>(Event::from(event))),
            )
        })
        .try_flatten()
        .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(metadata: serde_json::Value, exists: bool) -> Event<QualifiedName, DynamicObject> {
        let entry: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "monitor.fusion-app.io/v1alpha1",
            "kind": "ResourceMonitor",
            "metadata": metadata,
        }))
        .unwrap();
        Event {
            key: QualifiedName::from_resource(&entry),
            entry,
            exists,
        }
    }

    #[test]
    fn key_matches_subscription_key() {
        let e = event(json!({"name": "vms", "namespace": "ops"}), true);
        assert_eq!(e.key.to_string(), "ops/vms");
    }

    fn monitor(name: &str) -> DynamicObject {
        event(json!({"name": name, "namespace": "ops"}), true).entry
    }

    #[test]
    fn monitors_gone_during_relist_are_released() {
        let mut informer = Informer::default();
        informer.apply(watcher::Event::Applied(monitor("a")));
        informer.apply(watcher::Event::Applied(monitor("b")));

        let events: Vec<Event<QualifiedName, DynamicObject>> = informer
            .apply(watcher::Event::Restarted(vec![monitor("b")]))
            .into_iter()
            .map(Event::from)
            .collect();
        let seen: Vec<_> = events
            .iter()
            .map(|e| (e.key.to_string(), e.is_live()))
            .collect();
        assert_eq!(seen, [("ops/a".to_string(), false), ("ops/b".to_string(), true)]);
    }

    #[test]
    fn deleting_monitor_is_not_live() {
        assert!(event(json!({"name": "a", "namespace": "n"}), true).is_live());
        assert!(!event(json!({"name": "a", "namespace": "n"}), false).is_live());
        assert!(!event(
            json!({"name": "a", "namespace": "n", "deletionTimestamp": "2024-01-01T00:00:00Z"}),
            true
        )
        .is_live());
    }
}
