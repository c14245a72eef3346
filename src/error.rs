use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Lock already held for job {0}")]
    LockAlreadyHeld(String),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lease {0} not found")]
    LeaseNotFound(i64),

    #[error("Etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command exited with status {0:?}")]
    ExitStatus(Option<i32>),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("No local IPv4 address found")]
    NoLocalIp,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CronError {
    /// True for the routine outcome of losing a lock race to another worker.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CronError::LockAlreadyHeld(_))
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
