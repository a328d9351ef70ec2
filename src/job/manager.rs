use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Collaborators, JobError, MonitorJob};
use crate::monitor::Subscription;

/// Keeps at most one running [`MonitorJob`] per subscription key.
///
/// The job map lock is held across cancelling and starting jobs,
/// so two jobs for one key never run at the same time.
/// Building a job connects its sink and writes the initial status under that lock,
/// so a slow broker or apiserver delays every other `acquire` and `release`, up to the connect timeout.
pub struct JobManager {
    deps: Arc<Collaborators>,
    root: CancellationToken,
    // key: namespace/name
    jobs: Mutex<HashMap<String, Arc<MonitorJob>>>,
}

impl JobManager {
    /// Jobs are cancelled when `root` is.
    pub fn new(deps: Collaborators, root: CancellationToken) -> Self {
        Self {
            deps: Arc::new(deps),
            root,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the job for `subscription`, creating or replacing it as needed.
    ///
    /// A job whose spec equals the subscription's is reused untouched.
    /// A job with a different spec is cancelled before its replacement starts.
    /// If the replacement cannot be built, the key is left without a job.
    pub async fn acquire(&self, subscription: &Subscription) -> Result<Arc<MonitorJob>, JobError> {
        let key = subscription.key();
        let mut jobs = self.jobs.lock().await;

        match jobs.get(&key).map(|job| job.spec() == &subscription.spec) {
            Some(true) => {
                log::info!("Use existing monitor job {key}");
                return Ok(Arc::clone(&jobs[&key]));
            }
            Some(false) => {
                log::info!("Renew monitor job {key}");
                if let Some(old) = jobs.remove(&key) {
                    old.cancel().await;
                }
            }
            None => log::info!("Create monitor job {key}"),
        }

        let job = MonitorJob::new(subscription.clone(), Arc::clone(&self.deps), &self.root).await;
        let job = match job {
            Ok(job) => Arc::new(job),
            Err(err) => {
                log::error!("Build monitor job {key} failed: {err}");
                return Err(err);
            }
        };
        job.start().await;
        jobs.insert(key, Arc::clone(&job));
        Ok(job)
    }

    /// Cancels and forgets the job for `key`, if any.
    pub async fn release(&self, key: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.remove(key) {
            log::info!("Clean monitor job {key}");
            job.cancel().await;
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<MonitorJob>> {
        self.jobs.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Cancels every job.
    pub async fn shutdown(&self) {
        let jobs: Vec<_> = self.jobs.lock().await.drain().collect();
        for (key, job) in jobs {
            log::info!("Clean monitor job {key}");
            job.cancel().await;
        }
        self.root.cancel();
    }
}
