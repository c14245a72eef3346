//! Worker-side components that talk to the coordination store.
//!
//! - [`JobWatcher`]: replays job definitions and streams changes and kill
//!   requests into the scheduler
//! - [`JobLock`]: per-job lease-bound lock so a firing runs on one worker
//! - [`Executor`]: jitter, lock, run `<shell> -c <command>`, report
//! - [`Registrar`]: keeps `workers/<ip>` alive while the worker runs
//!
//! # Execution flow
//!
//! 1. The scheduler dispatches an [`ExecutionRecord`](crate::scheduler::ExecutionRecord)
//! 2. [`Executor::execute`] sleeps a random jitter, then races for the lock
//! 3. The winner runs the command; losers report [`LockAlreadyHeld`](crate::error::CronError::LockAlreadyHeld)
//! 4. Every path sends exactly one result back to the scheduler
//!
//! Commands run through the shell without sandboxing.

pub mod executor;
pub mod heartbeat;
pub mod lock;
pub mod watcher;

pub use executor::Executor;
pub use heartbeat::{local_ip, Registrar};
pub use lock::JobLock;
pub use watcher::JobWatcher;
