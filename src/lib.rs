pub mod config;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod logs;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{CronError, Result};
