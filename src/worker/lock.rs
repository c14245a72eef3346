use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::keys::Keyspace;
use crate::store::{CoordinationStore, Lease, LeaseId};

/// Cross-worker mutual exclusion for one job, held as a lease-bound key
/// under `lock/<name>`.
///
/// The key is created with a compare-and-swap on its create revision, so at
/// most one worker holds it. While held, a background task renews the
/// lease. If the holder dies without unlocking, renewal stops and the key
/// disappears one TTL later.
pub struct JobLock {
    store: Arc<dyn CoordinationStore>,
    job_name: String,
    key: String,
    lease_ttl: Duration,
    lease: Option<LeaseId>,
    renewal: Option<CancellationToken>,
    locked: bool,
}

impl JobLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: &Keyspace,
        job_name: &str,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            job_name: job_name.to_string(),
            key: keys.lock_key(job_name),
            lease_ttl,
            lease: None,
            renewal: None,
            locked: false,
        }
    }

    /// Try once to take the lock.
    ///
    /// Returns [`CronError::LockAlreadyHeld`] when another holder owns the
    /// key. Any failure releases the lease granted for this attempt.
    pub async fn try_lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }

        let lease = self.store.grant_lease(self.lease_ttl).await?;
        let renewal = CancellationToken::new();

        match self.acquire(lease, &renewal).await {
            Ok(()) => {
                tracing::debug!(job = %self.job_name, lease = lease.id, "Lock acquired");
                self.lease = Some(lease.id);
                self.renewal = Some(renewal);
                self.locked = true;
                Ok(())
            }
            Err(e) => {
                renewal.cancel();
                if let Err(revoke_err) = self.store.revoke_lease(lease.id).await {
                    tracing::debug!(
                        job = %self.job_name,
                        lease = lease.id,
                        error = %revoke_err,
                        "Failed to revoke lease of a lost lock attempt"
                    );
                }
                Err(e)
            }
        }
    }

    async fn acquire(&self, lease: Lease, renewal: &CancellationToken) -> Result<()> {
        // Renewal runs until the token is cancelled; acknowledgements are not needed here.
        let _acks = self.store.keep_alive(lease, renewal.clone()).await?;

        if self
            .store
            .create_if_absent(&self.key, Vec::new(), lease.id)
            .await?
        {
            Ok(())
        } else {
            Err(CronError::LockAlreadyHeld(self.job_name.clone()))
        }
    }

    /// Release the lock: stop renewal and revoke the lease, which deletes the
    /// key immediately. No-op if the lock is not held.
    pub async fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;

        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.store.revoke_lease(lease).await {
                tracing::warn!(job = %self.job_name, lease, error = %e, "Failed to revoke lock lease");
            } else {
                tracing::debug!(job = %self.job_name, lease, "Lock released");
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }
}

impl Drop for JobLock {
    // Dropped without unlock: stop renewing so the key expires on its own.
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
    }
}
