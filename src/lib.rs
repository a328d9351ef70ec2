//! kube-cdc republishes changes to a dynamically selected set of cluster objects,
//! enriched with their metrics, as a deduplicated message stream.
//!
//! Each ResourceMonitor object declares a subscription: a kind and label selector to watch,
//! a Prometheus source to poll, and an MQTT topic to publish to.
//! The [`JobManager`] runs one [`MonitorJob`](job::MonitorJob) per subscription,
//! and replaces it when the subscription's spec changes.
//!
//! Every job publishes a `RegisterSchema` message describing the watched payload once,
//! then `New`/`Update`/`Delete` messages for related objects. Metric values
//! are merged into the last known message of an object as an `extras` block.

pub mod config;
pub use config::Settings;
pub mod job;
pub use job::{Collaborators, JobManager};
pub mod message;
pub mod metric;
pub mod monitor;
pub use monitor::Subscription;
mod runner;
pub use runner::run;
pub mod sink;
pub mod source;
pub mod subscriber;

#[cfg(test)]
mod tests;
