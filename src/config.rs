use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CronError, Result};
use crate::keys::Keyspace;

/// Connection settings for the etcd cluster.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Distributed job lock tuning.
///
/// `jitter_max` must stay below `lease_ttl` so a lock attempt always leaves
/// the renewal task time to establish before the lease could lapse.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease TTL backing each lock key.
    pub lease_ttl: Duration,
    /// Upper bound of the random delay before competing for a lock.
    pub jitter_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            jitter_max: Duration::from_secs(1),
        }
    }
}

/// Execution log batching.
#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    /// Flush as soon as a batch holds this many records.
    pub batch_size: usize,
    /// Flush a partial batch this long after its first record arrived.
    pub commit_timeout: Duration,
    /// Intake buffer; records beyond it are dropped and counted.
    pub channel_capacity: usize,
    /// JSON-lines file the worker appends execution logs to.
    pub path: PathBuf,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            commit_timeout: Duration::from_millis(1000),
            channel_capacity: 1000,
            path: PathBuf::from("cron-lite-logs.jsonl"),
        }
    }
}

/// Worker liveness registration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub lease_ttl: Duration,
    /// Pause before re-registering after any failure.
    pub retry_backoff: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub keys: Keyspace,
    pub lock: LockConfig,
    pub log_sink: LogSinkConfig,
    pub heartbeat: HeartbeatConfig,
    /// Shell used to run job commands as `<shell> -c <command>`.
    pub shell: String,
    /// IP published under `workers/`. Resolved from the network when unset.
    pub advertise_ip: Option<String>,
    /// Pause before re-opening a watch that closed unexpectedly.
    pub watch_retry: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            keys: Keyspace::default(),
            lock: LockConfig::default(),
            log_sink: LogSinkConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            shell: "/bin/sh".to_string(),
            advertise_ip: None,
            watch_retry: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Replace the store endpoints, defaults included.
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keys(mut self, keys: Keyspace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_advertise_ip(mut self, ip: impl Into<String>) -> Self {
        self.advertise_ip = Some(ip.into());
        self
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(CronError::Config("at least one store endpoint is required".into()));
        }
        if self.lock.lease_ttl.is_zero() {
            return Err(CronError::Config("lock lease TTL must be positive".into()));
        }
        if self.lock.jitter_max >= self.lock.lease_ttl {
            return Err(CronError::Config(format!(
                "lock jitter ({:?}) must be shorter than the lock lease TTL ({:?})",
                self.lock.jitter_max, self.lock.lease_ttl
            )));
        }
        if self.heartbeat.lease_ttl.is_zero() {
            return Err(CronError::Config("heartbeat lease TTL must be positive".into()));
        }
        if self.log_sink.batch_size == 0 {
            return Err(CronError::Config("log batch size must be at least 1".into()));
        }
        if self.log_sink.channel_capacity == 0 {
            return Err(CronError::Config("log channel capacity must be at least 1".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(CronError::Config("shell must not be empty".into()));
        }
        Ok(())
    }
}
