use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::Keyspace;
use crate::scheduler::job::{Job, JobEvent};
use crate::scheduler::SchedulerHandle;
use crate::store::{CoordinationStore, WatchEvent, WatchEventKind};

/// Turns the `jobs/` and `killer/` subtrees of the store into job events for
/// the scheduler.
#[derive(Clone)]
pub struct JobWatcher {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    scheduler: SchedulerHandle,
    retry: Duration,
}

impl JobWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keyspace,
        scheduler: SchedulerHandle,
        retry: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            scheduler,
            retry,
        }
    }

    /// Replay the current job list and start watching for changes made after it.
    ///
    /// The listing itself must succeed; once it has, the returned task keeps
    /// the watches alive until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let revision = self.bootstrap().await?;
        Ok(tokio::spawn(self.run(revision + 1, shutdown)))
    }

    /// Emit a Saved event for every decodable job and return the revision the
    /// listing was taken at.
    pub async fn bootstrap(&self) -> Result<i64> {
        let snapshot = self.store.get_prefix(&self.keys.jobs_prefix()).await?;

        let mut loaded = 0usize;
        for kv in &snapshot.kvs {
            match Job::decode(&kv.value) {
                Ok(job) => {
                    self.scheduler.push_event(JobEvent::saved(job));
                    loaded += 1;
                }
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job definition"),
            }
        }

        tracing::info!(jobs = loaded, revision = snapshot.revision, "Loaded job definitions");
        Ok(snapshot.revision)
    }

    /// Follow both prefixes from `start_revision` until shutdown.
    pub async fn run(self, start_revision: i64, shutdown: CancellationToken) {
        let jobs_prefix = self.keys.jobs_prefix();
        let killer_prefix = self.keys.killer_prefix();

        tokio::join!(
            self.follow(&jobs_prefix, start_revision, &shutdown, job_event),
            self.follow(&killer_prefix, start_revision, &shutdown, kill_event),
        );
        tracing::debug!("Job watcher stopped");
    }

    /// Keep a watch on `prefix` open, re-establishing it after the last
    /// delivered revision whenever the stream breaks.
    async fn follow(
        &self,
        prefix: &str,
        start_revision: i64,
        shutdown: &CancellationToken,
        translate: fn(&Keyspace, &WatchEvent) -> Option<JobEvent>,
    ) {
        let mut next_revision = start_revision;

        loop {
            let opened = tokio::select! {
                opened = self.store.watch_prefix(prefix, next_revision) => opened,
                _ = shutdown.cancelled() => return,
            };

            match opened {
                Ok(mut events) => {
                    tracing::debug!(prefix, revision = next_revision, "Watch established");
                    loop {
                        tokio::select! {
                            maybe_event = events.recv() => {
                                let Some(event) = maybe_event else {
                                    tracing::warn!(prefix, revision = next_revision, "Watch stream closed, re-establishing");
                                    break;
                                };
                                next_revision = event.revision + 1;
                                if let Some(job_event) = translate(&self.keys, &event) {
                                    if !self.scheduler.push_event(job_event) {
                                        tracing::debug!(prefix, "Scheduler gone, stopping watch");
                                        return;
                                    }
                                }
                            }
                            _ = shutdown.cancelled() => return,
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(prefix, error = %e, "Failed to open watch");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

fn job_event(keys: &Keyspace, event: &WatchEvent) -> Option<JobEvent> {
    match event.kind {
        WatchEventKind::Put => match Job::decode(&event.value) {
            Ok(job) => Some(JobEvent::saved(job)),
            Err(e) => {
                tracing::warn!(key = %event.key, error = %e, "Skipping malformed job update");
                None
            }
        },
        WatchEventKind::Delete => keys.job_name(&event.key).map(JobEvent::deleted),
    }
}

fn kill_event(keys: &Keyspace, event: &WatchEvent) -> Option<JobEvent> {
    match event.kind {
        WatchEventKind::Put => keys.killed_job_name(&event.key).map(JobEvent::killed),
        // Kill markers expire with their lease; the removal means nothing.
        WatchEventKind::Delete => None,
    }
}
