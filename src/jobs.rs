use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::keys::Keyspace;
use crate::scheduler::job::Job;
use crate::store::CoordinationStore;

/// Lifetime of a kill marker. Long enough for every watching worker to see
/// the put, short enough that the key cleans itself up.
const KILL_LEASE_TTL: Duration = Duration::from_secs(1);

/// Control-plane operations on job definitions, kill requests and the worker
/// registry.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
}

impl JobStore {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Create or replace a job. Returns the definition it replaced, if that
    /// was readable.
    pub async fn save(&self, job: &Job) -> Result<Option<Job>> {
        job.validate()?;
        let previous = self
            .store
            .put(&self.keys.job_key(&job.name), job.encode()?, None)
            .await?;
        tracing::info!(job = %job.name, cron = %job.cron_expr, "Job saved");
        Ok(previous.and_then(|kv| Job::decode(&kv.value).ok()))
    }

    /// Remove a job. Returns the removed definition, if there was one.
    pub async fn delete(&self, name: &str) -> Result<Option<Job>> {
        let removed = self.store.delete(&self.keys.job_key(name)).await?;
        if removed.is_some() {
            tracing::info!(job = %name, "Job deleted");
        }
        Ok(removed.and_then(|kv| Job::decode(&kv.value).ok()))
    }

    /// All decodable job definitions, ordered by key.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let snapshot = self.store.get_prefix(&self.keys.jobs_prefix()).await?;
        let jobs = snapshot
            .kvs
            .iter()
            .filter_map(|kv| match Job::decode(&kv.value) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job definition");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Ask every worker to kill its running execution of `name`.
    pub async fn kill(&self, name: &str) -> Result<()> {
        let lease = self.store.grant_lease(KILL_LEASE_TTL).await?;
        self.store
            .put(&self.keys.kill_key(name), Vec::new(), Some(lease.id))
            .await?;
        tracing::info!(job = %name, "Kill requested");
        Ok(())
    }

    /// IPs of the workers currently holding a live registration.
    pub async fn list_workers(&self) -> Result<Vec<String>> {
        let snapshot = self.store.get_prefix(&self.keys.workers_prefix()).await?;
        Ok(snapshot
            .kvs
            .iter()
            .filter_map(|kv| self.keys.worker_ip(&kv.key))
            .map(str::to_string)
            .collect())
    }
}
