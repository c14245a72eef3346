use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::config::{LockConfig, WorkerConfig};
use crate::error::CronError;
use crate::keys::Keyspace;
use crate::scheduler::job::{ExecutionRecord, ExecutionResult};
use crate::store::CoordinationStore;
use crate::worker::lock::JobLock;

/// Runs job commands under their distributed lock.
///
/// Each execution is a tracked background task that reports exactly one
/// [`ExecutionResult`], whether the command ran, failed, was killed, or the
/// lock went to another worker.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    lock: LockConfig,
    shell: String,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: Keyspace,
        lock: LockConfig,
        shell: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keys,
            lock,
            shell: shell.into(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &WorkerConfig) -> Self {
        Self::new(
            store,
            config.keys.clone(),
            config.lock.clone(),
            config.shell.clone(),
        )
    }

    /// Run `record` in the background and send its result to `results`.
    pub fn execute(&self, record: ExecutionRecord, results: mpsc::UnboundedSender<ExecutionResult>) {
        let executor = self.clone();
        self.tracker.spawn(async move {
            let result = executor.run(record).await;
            if results.send(result).is_err() {
                tracing::warn!("Scheduler stopped, dropping execution result");
            }
        });
    }

    /// Wait for every execution started so far to report.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of executions still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Execute one firing to completion.
    pub async fn run(&self, record: ExecutionRecord) -> ExecutionResult {
        let start_time = Utc::now();

        // Spread competing workers out before they race for the lock.
        let killed = tokio::select! {
            _ = tokio::time::sleep(self.jitter()) => false,
            _ = record.cancel.cancelled() => true,
        };
        if killed {
            tracing::info!(job = %record.job.name, "Job killed before it started");
            return ExecutionResult {
                record,
                output: Vec::new(),
                error: Some(CronError::Cancelled),
                start_time,
                end_time: Utc::now(),
            };
        }

        let mut lock = JobLock::new(
            self.store.clone(),
            &self.keys,
            &record.job.name,
            self.lock.lease_ttl,
        );
        if let Err(e) = lock.try_lock().await {
            if e.is_lock_contention() {
                tracing::debug!(job = %record.job.name, "Lock held by another worker, skipping");
            } else {
                tracing::warn!(job = %record.job.name, error = %e, "Failed to acquire job lock");
            }
            return ExecutionResult {
                record,
                output: Vec::new(),
                error: Some(e),
                start_time,
                end_time: Utc::now(),
            };
        }

        // Time spent waiting on jitter and the lock is not run time.
        let start_time = Utc::now();
        let (output, error) = self.run_command(&record).await;
        let end_time = Utc::now();
        lock.unlock().await;

        match &error {
            None => tracing::info!(job = %record.job.name, "Job completed"),
            Some(e) => tracing::info!(job = %record.job.name, error = %e, "Job failed"),
        }

        ExecutionResult {
            record,
            output,
            error,
            start_time,
            end_time,
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.lock.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run the command through the shell, returning its combined output and
    /// the failure, if any. Cancellation kills the child.
    async fn run_command(&self, record: &ExecutionRecord) -> (Vec<u8>, Option<CronError>) {
        tracing::info!(
            job = %record.job.name,
            command = %record.job.command,
            plan_time = %record.plan_time,
            "Executing job"
        );

        let (mut child, mut reader) = match self.spawn_shell(&record.job.command) {
            Ok(spawned) => spawned,
            Err(e) => return (Vec::new(), Some(CronError::Io(e))),
        };

        let mut output = Vec::new();
        let finished = async {
            let (read, status) = tokio::join!(reader.read_to_end(&mut output), child.wait());
            read.and(status)
        };

        let error = tokio::select! {
            status = finished => match status {
                Ok(status) => (!status.success()).then(|| CronError::ExitStatus(status.code())),
                Err(e) => Some(CronError::Io(e)),
            },
            _ = record.cancel.cancelled() => {
                tracing::info!(job = %record.job.name, "Job killed");
                return (Vec::new(), Some(CronError::Cancelled));
            }
        };
        (output, error)
    }

    /// Start `<shell> -c <command>` with stdout and stderr sharing one pipe,
    /// so the output keeps the order the child wrote it in.
    fn spawn_shell(&self, command: &str) -> io::Result<(Child, pipe::Receiver)> {
        let (writer, reader) = pipe::pipe()?;
        let writer = writer.into_blocking_fd()?;

        // The command owns the parent's copies of the write end and must be
        // dropped after spawning, or the reader never sees EOF.
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        drop(cmd);

        Ok((child, reader))
    }
}
