pub mod engine;
pub mod job;
pub mod plan;

pub use engine::{Scheduler, SchedulerHandle};
pub use job::{ExecutionRecord, ExecutionResult, Job, JobEvent, JobEventKind};
pub use plan::{CronSchedule, SchedulePlan};
