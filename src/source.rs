//! The cluster-facing collaborators of a job.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use kube_core::DynamicObject;

use crate::monitor::{Gvk, SelectorSpec};

pub mod kube;
pub use self::kube::{Informer, KubeResources, KubeStatusWriter};

/// A change to one object of the watched kind, carrying the full object.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Added(DynamicObject),
    Updated {
        old: DynamicObject,
        new: DynamicObject,
    },
    Deleted(DynamicObject),
}

/// Lists and watches objects of a kind.
pub trait ResourceSource: Send + Sync {
    /// Objects currently matching `selector`.
    fn list<'a>(
        &'a self,
        selector: &'a SelectorSpec,
    ) -> BoxFuture<'a, Result<Vec<DynamicObject>, SourceError>>;

    /// Every change to any object of kind `gvk`, in any namespace and with any labels.
    fn watch(&self, gvk: &Gvk) -> BoxStream<'static, Result<ResourceEvent, SourceError>>;
}

/// Writes the observed state of a monitor object.
pub trait StatusWriter: Send + Sync {
    fn patch_status<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        selected: usize,
    ) -> BoxFuture<'a, Result<(), SourceError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube_client::Error),
    #[error("watch failed: {0}")]
    Watch(#[from] kube_runtime::watcher::Error),
}
