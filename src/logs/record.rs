use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::ExecutionResult;

/// Persisted record of one execution attempt. Timestamps are Unix
/// milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub job_name: String,
    pub command: String,
    pub output: String,
    /// Empty when the execution succeeded.
    pub err: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub plan_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub schedule_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
}

impl From<&ExecutionResult> for LogRecord {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            job_name: result.record.job.name.clone(),
            command: result.record.job.command.clone(),
            output: String::from_utf8_lossy(&result.output).into_owned(),
            err: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            plan_time: result.record.plan_time,
            schedule_time: result.record.real_time,
            start_time: result.start_time,
            end_time: result.end_time,
        }
    }
}
