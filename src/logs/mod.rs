//! Execution log pipeline.
//!
//! Every execution result becomes a [`LogRecord`]. Records flow through a
//! [`LogSinkHandle`] into a single [`LogSink`] task that groups them into
//! batches and hands each batch to a [`LogStore`]:
//!
//! - a batch is written as soon as it reaches the configured size
//! - a partial batch is written once its commit timeout passes
//! - a full intake buffer drops records (counted) rather than blocking
//!
//! Log delivery is best-effort: failed writes are logged and forgotten.

pub mod record;
pub mod sink;
pub mod store;

pub use record::LogRecord;
pub use sink::{LogSink, LogSinkHandle};
pub use store::{JsonLinesLogStore, LogStore, MemoryLogStore};
