use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};
use crate::scheduler::job::Job;

/// A parsed cron expression.
///
/// Accepts the `cron` crate's seconds-first 6 or 7 field syntax. Classic
/// 5-field expressions are read as minute resolution with seconds fixed at 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| CronError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

/// A job together with its parsed schedule and next fire time.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub job: Job,
    pub schedule: CronSchedule,
    pub next_time: DateTime<Utc>,
}

impl SchedulePlan {
    /// Build a plan whose first firing is the schedule's next time after `now`.
    pub fn new(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let schedule = CronSchedule::parse(&job.cron_expr)?;
        let next_time = schedule.next_after(&now).ok_or_else(|| CronError::InvalidCron {
            expr: job.cron_expr.clone(),
            reason: "expression never fires again".to_string(),
        })?;
        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_time <= now
    }

    /// Move `next_time` past `now`. Returns false if the schedule is exhausted.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match self.schedule.next_after(&now) {
            Some(next) => {
                self.next_time = next;
                true
            }
            None => false,
        }
    }
}
