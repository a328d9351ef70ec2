use std::fmt;
use std::pin::pin;

use futures::{Stream, StreamExt};
use kube_core::DynamicObject;

use crate::job::JobManager;
use crate::subscriber::{Event, QualifiedName};

/// Drives `manager` from a stream of monitor events until the stream ends.
///
/// Live monitors acquire a job and gone ones release it.
/// Errors, of a single monitor or of the stream itself, are logged and skipped;
/// a watcher with backoff keeps yielding events after a failure.
pub async fn run<S, E>(manager: &JobManager, subscriptions: S)
where
    S: Stream<Item = Result<Event<QualifiedName, DynamicObject>, E>>,
    E: fmt::Display,
{
    let mut sub = pin!(subscriptions);
    while let Some(event) = sub.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Monitor watch failed: {err}");
                continue;
            }
        };

        let key = event.key.to_string();
        if !event.is_live() {
            manager.release(&key).await;
            continue;
        }

        match event.subscription() {
            Ok(subscription) => {
                if let Err(err) = manager.acquire(&subscription).await {
                    log::error!("Monitor {key} has no job: {err}");
                }
            }
            Err(err) => log::error!("Monitor {key} is invalid: {err}"),
        }
    }
}
