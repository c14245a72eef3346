use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CronError, Result};
use crate::scheduler::plan::CronSchedule;

/// A cron job as stored under `jobs/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// A job known only by name, as carried by delete and kill events.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "", "")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check the definition is storable and schedulable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CronError::InvalidJob("name must not be empty".into()));
        }
        if self.name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "name {:?} must not contain '/'",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(CronError::InvalidJob("command must not be empty".into()));
        }
        CronSchedule::parse(&self.cron_expr)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Saved,
    Deleted,
    Killed,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Saved => write!(f, "saved"),
            JobEventKind::Deleted => write!(f, "deleted"),
            JobEventKind::Killed => write!(f, "killed"),
        }
    }
}

/// A change to the job set observed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

impl JobEvent {
    pub fn saved(job: Job) -> Self {
        Self {
            kind: JobEventKind::Saved,
            job,
        }
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Deleted,
            job: Job::named(name),
        }
    }

    pub fn killed(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Killed,
            job: Job::named(name),
        }
    }
}

/// One accepted firing of a job, from dispatch until its result comes back.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job: Job,
    /// When the schedule said the job should run.
    pub plan_time: DateTime<Utc>,
    /// When the scheduler actually dispatched it.
    pub real_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl ExecutionRecord {
    pub fn new(job: Job, plan_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            plan_time,
            real_time: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one execution attempt, including lost lock races.
#[derive(Debug)]
pub struct ExecutionResult {
    pub record: ExecutionRecord,
    /// Captured stdout and stderr, interleaved as the command wrote them.
    pub output: Vec<u8>,
    pub error: Option<CronError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn job_name(&self) -> &str {
        &self.record.job.name
    }

    /// True if the command actually ran on this worker.
    pub fn ran(&self) -> bool {
        !matches!(&self.error, Some(e) if e.is_lock_contention())
    }
}
