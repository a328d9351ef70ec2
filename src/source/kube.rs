use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use kube_client::api::{Api, ListParams, Patch, PatchParams};
use kube_client::Client;
use kube_core::{ApiResource, DynamicObject, GroupVersionKind, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde_json::json;

use super::{ResourceEvent, ResourceSource, SourceError, StatusWriter};
use crate::monitor::{Gvk, SelectorSpec};

/// [`ResourceSource`] backed by the apiserver.
#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ResourceSource for KubeResources {
    fn list<'a>(
        &'a self,
        selector: &'a SelectorSpec,
    ) -> BoxFuture<'a, Result<Vec<DynamicObject>, SourceError>> {
        Box::pin(async move {
            let resource = ApiResource::from_gvk(&selector.gvk.to_kube());
            let api = if selector.namespace.is_empty() {
                Api::<DynamicObject>::all_with(self.client.clone(), &resource)
            } else {
                Api::namespaced_with(self.client.clone(), &selector.namespace, &resource)
            };

            let mut params = ListParams::default();
            if !selector.labels.is_empty() {
                params = params.labels(&selector.label_selector());
            }
            let list = api.list(&params).await?;
            Ok(list
                .items
                .into_iter()
                .filter(|object| selector.matches(object))
                .collect())
        })
    }

    fn watch(&self, gvk: &Gvk) -> BoxStream<'static, Result<ResourceEvent, SourceError>> {
        let resource = ApiResource::from_gvk(&gvk.to_kube());
        let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource);
        let mut informer = Informer::default();

        watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(SourceError::Watch)
            .map_ok(move |event| {
                stream::iter(informer.apply(event).into_iter().map(Ok::<_, SourceError>))
            })
            .try_flatten()
            .boxed()
    }
}

/// Turns watcher notifications into add/update/delete events
/// by remembering the last seen version of every object.
#[derive(Debug, Default)]
pub struct Informer {
    known: HashMap<(String, String), DynamicObject>,
}

impl Informer {
    pub fn apply(&mut self, event: watcher::Event<DynamicObject>) -> Vec<ResourceEvent> {
        match event {
            watcher::Event::Applied(object) => vec![self.applied(object)],
            watcher::Event::Deleted(object) => {
                self.known.remove(&key(&object));
                vec![ResourceEvent::Deleted(object)]
            }
            watcher::Event::Restarted(objects) => {
                let live: HashSet<_> = objects.iter().map(key).collect();
                let gone: Vec<_> = self
                    .known
                    .keys()
                    .filter(|k| !live.contains(*k))
                    .cloned()
                    .collect();

                let mut events: Vec<_> = gone
                    .into_iter()
                    .filter_map(|k| self.known.remove(&k))
                    .map(ResourceEvent::Deleted)
                    .collect();
                events.extend(objects.into_iter().map(|object| self.applied(object)));
                events
            }
        }
    }

    fn applied(&mut self, object: DynamicObject) -> ResourceEvent {
        match self.known.insert(key(&object), object.clone()) {
            Some(old) => ResourceEvent::Updated { old, new: object },
            None => ResourceEvent::Added(object),
        }
    }
}

fn key(object: &DynamicObject) -> (String, String) {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// [`StatusWriter`] that merge-patches `status.selected` of monitor objects.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
    monitor: ApiResource,
}

impl KubeStatusWriter {
    /// `monitor` is the kind of the objects subscriptions are read from.
    pub fn new(client: Client, monitor: &GroupVersionKind) -> Self {
        Self {
            client,
            monitor: ApiResource::from_gvk(monitor),
        }
    }
}

impl StatusWriter for KubeStatusWriter {
    fn patch_status<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        selected: usize,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            let api =
                Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &self.monitor);
            let patch = json!({"status": {"selected": selected}});
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
    }
}
