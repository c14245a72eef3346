use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logs::{LogRecord, LogSinkHandle};
use crate::scheduler::job::{ExecutionRecord, ExecutionResult, JobEvent, JobEventKind};
use crate::scheduler::plan::SchedulePlan;
use crate::worker::executor::Executor;

/// How long to sleep when there is nothing scheduled at all.
const EMPTY_TABLE_WAKE: Duration = Duration::from_secs(1);

/// Sending side of the scheduler's event channel.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    events: mpsc::UnboundedSender<JobEvent>,
}

impl SchedulerHandle {
    /// Queue a job event. Returns false once the scheduler has stopped.
    pub fn push_event(&self, event: JobEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Owner of the schedule table and the executing set.
///
/// All mutation happens on the task running [`Scheduler::run`]; watchers and
/// executors only ever talk to it through channels, so neither table needs
/// a lock.
pub struct Scheduler {
    plans: HashMap<String, SchedulePlan>,
    executing: HashMap<String, ExecutionRecord>,
    executor: Executor,
    logs: LogSinkHandle,
    event_rx: mpsc::UnboundedReceiver<JobEvent>,
    result_tx: mpsc::UnboundedSender<ExecutionResult>,
    result_rx: mpsc::UnboundedReceiver<ExecutionResult>,
}

impl Scheduler {
    pub fn new(executor: Executor, logs: LogSinkHandle) -> (Self, SchedulerHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            plans: HashMap::new(),
            executing: HashMap::new(),
            executor,
            logs,
            event_rx,
            result_tx,
            result_rx,
        };
        (scheduler, SchedulerHandle { events: event_tx })
    }

    /// Main scheduling loop.
    ///
    /// Waits on job events, the next-fire timer and execution results. Every
    /// wake-up, whatever its cause, ends with a rescheduling pass that starts
    /// due jobs and re-arms the timer for the nearest next fire time.
    ///
    /// On shutdown, in-flight executions are killed and their results logged
    /// before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let wake_after = self.try_schedule(Utc::now());
        let timer = tokio::time::sleep(wake_after);
        tokio::pin!(timer);
        let mut events_open = true;

        loop {
            tokio::select! {
                maybe_event = self.event_rx.recv(), if events_open => {
                    match maybe_event {
                        Some(event) => self.handle_event(event, Utc::now()),
                        None => {
                            tracing::warn!("Job event channel closed, no further job updates will arrive");
                            events_open = false;
                        }
                    }
                }

                _ = &mut timer => {}

                Some(result) = self.result_rx.recv() => {
                    self.handle_result(result);
                }

                _ = shutdown.cancelled() => break,
            }

            let wake_after = self.try_schedule(Utc::now());
            timer.as_mut().reset(Instant::now() + wake_after);
        }

        self.drain().await;
    }

    async fn drain(&mut self) {
        for record in self.executing.values() {
            record.cancel.cancel();
        }
        self.executor.wait_idle().await;
        while let Ok(result) = self.result_rx.try_recv() {
            self.handle_result(result);
        }
        tracing::info!(plans = self.plans.len(), "Scheduler stopped");
    }

    /// Apply one job event to the schedule table.
    pub fn handle_event(&mut self, event: JobEvent, now: DateTime<Utc>) {
        let name = event.job.name.clone();
        match event.kind {
            JobEventKind::Saved => match SchedulePlan::new(event.job, now) {
                Ok(plan) => {
                    tracing::info!(job = %name, cron = %plan.schedule.expr(), next = %plan.next_time, "Job scheduled");
                    self.plans.insert(name, plan);
                }
                Err(e) => {
                    tracing::warn!(job = %name, error = %e, "Ignoring job update with invalid schedule");
                }
            },
            JobEventKind::Deleted => {
                if self.plans.remove(&name).is_some() {
                    tracing::info!(job = %name, "Job unscheduled");
                }
            }
            JobEventKind::Killed => match self.executing.get(&name) {
                Some(record) => {
                    tracing::info!(job = %name, execution = %record.id, "Killing running job");
                    record.cancel.cancel();
                }
                None => tracing::debug!(job = %name, "Kill request for a job that is not running"),
            },
        }
    }

    /// Apply every event already queued, without waiting for more. Returns
    /// how many were applied.
    pub fn apply_pending_events(&mut self, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event, now);
            applied += 1;
        }
        applied
    }

    /// Start every due job and return how long to sleep until the next one.
    ///
    /// A due plan advances to its next fire time after `now` whether or not
    /// it could start, so a job that is still running skips missed ticks
    /// instead of queuing them.
    pub fn try_schedule(&mut self, now: DateTime<Utc>) -> Duration {
        if self.plans.is_empty() {
            return EMPTY_TABLE_WAKE;
        }

        let mut nearest: Option<DateTime<Utc>> = None;
        let mut exhausted = Vec::new();

        for (name, plan) in self.plans.iter_mut() {
            if plan.is_due(now) {
                try_start(&mut self.executing, &self.executor, &self.result_tx, plan);
                if !plan.advance(now) {
                    exhausted.push(name.clone());
                    continue;
                }
            }
            nearest = Some(nearest.map_or(plan.next_time, |n| n.min(plan.next_time)));
        }

        for name in exhausted {
            tracing::info!(job = %name, "Job schedule has no further fire times, unscheduling");
            self.plans.remove(&name);
        }

        match nearest {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
            None => EMPTY_TABLE_WAKE,
        }
    }

    /// Retire a finished execution and forward its log record.
    pub fn handle_result(&mut self, result: ExecutionResult) {
        let name = result.job_name().to_string();
        match self.executing.get(&name) {
            Some(record) if record.id == result.record.id => {
                self.executing.remove(&name);
            }
            _ => tracing::debug!(job = %name, execution = %result.record.id, "Result for an untracked execution"),
        }

        tracing::debug!(
            job = %name,
            ran = result.ran(),
            error = ?result.error.as_ref().map(|e| e.to_string()),
            "Execution finished"
        );
        self.logs.append(LogRecord::from(&result));
    }

    /// Wait for the next execution result and apply it. Returns the job name,
    /// or `None` if the wait timed out.
    pub async fn handle_next_result(&mut self, timeout: Duration) -> Option<String> {
        let result = tokio::time::timeout(timeout, self.result_rx.recv())
            .await
            .ok()
            .flatten()?;
        let name = result.job_name().to_string();
        self.handle_result(result);
        Some(name)
    }

    pub fn plan(&self, name: &str) -> Option<&SchedulePlan> {
        self.plans.get(name)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    pub fn executing(&self, name: &str) -> Option<&ExecutionRecord> {
        self.executing.get(name)
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }
}

/// Dispatch `plan` unless the same job is still executing locally.
fn try_start(
    executing: &mut HashMap<String, ExecutionRecord>,
    executor: &Executor,
    results: &mpsc::UnboundedSender<ExecutionResult>,
    plan: &SchedulePlan,
) -> bool {
    if executing.contains_key(&plan.job.name) {
        tracing::debug!(job = %plan.job.name, "Job still running, skipping this firing");
        return false;
    }

    let record = ExecutionRecord::new(plan.job.clone(), plan.next_time);
    tracing::debug!(
        job = %plan.job.name,
        execution = %record.id,
        plan_time = %record.plan_time,
        "Starting job"
    );
    executing.insert(plan.job.name.clone(), record.clone());
    executor.execute(record, results.clone());
    true
}
