use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogSinkConfig;
use crate::logs::record::LogRecord;
use crate::logs::store::LogStore;

/// Records accumulated since the last flush. `id` is the batch identity an
/// expiry timer refers back to.
#[derive(Debug)]
struct LogBatch {
    id: u64,
    records: Vec<LogRecord>,
}

struct OpenBatch {
    batch: LogBatch,
    timer: AbortHandle,
}

/// Cloneable, non-blocking entry point into a running [`LogSink`].
#[derive(Debug, Clone)]
pub struct LogSinkHandle {
    tx: mpsc::Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl LogSinkHandle {
    /// Queue a record without waiting. When the intake buffer is full or the
    /// sink has stopped, the record is discarded and counted instead.
    pub fn append(&self, record: LogRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(job = %record.job_name, dropped, "Log intake full, dropping record");
                false
            }
            Err(TrySendError::Closed(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(job = %record.job_name, dropped, "Log sink stopped, dropping record");
                false
            }
        }
    }

    /// Records discarded so far because the sink could not take them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Batches execution logs and writes them to a [`LogStore`] when a batch
/// fills up or its commit timeout passes, whichever comes first.
pub struct LogSink {
    store: Arc<dyn LogStore>,
    batch_size: usize,
    commit_timeout: Duration,
    intake_rx: mpsc::Receiver<LogRecord>,
    expiry_tx: mpsc::Sender<u64>,
    expiry_rx: mpsc::Receiver<u64>,
    next_batch_id: u64,
}

impl LogSink {
    pub fn new(config: &LogSinkConfig, store: Arc<dyn LogStore>) -> (Self, LogSinkHandle) {
        let (tx, intake_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (expiry_tx, expiry_rx) = mpsc::channel(config.channel_capacity.max(1));

        let sink = Self {
            store,
            batch_size: config.batch_size.max(1),
            commit_timeout: config.commit_timeout,
            intake_rx,
            expiry_tx,
            expiry_rx,
            next_batch_id: 0,
        };
        let handle = LogSinkHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, handle)
    }

    /// Run until `shutdown` fires or every handle is dropped, then flush
    /// whatever is still open. Records accepted before shutdown are written;
    /// appends after it count as dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut open: Option<OpenBatch> = None;

        loop {
            tokio::select! {
                maybe_record = self.intake_rx.recv() => {
                    let Some(record) = maybe_record else { break };
                    self.accept(&mut open, record).await;
                }

                Some(expired_id) = self.expiry_rx.recv() => {
                    if open.as_ref().is_some_and(|o| o.batch.id == expired_id) {
                        if let Some(expired) = open.take() {
                            self.flush(expired.batch).await;
                        }
                    } else {
                        tracing::trace!(batch = expired_id, "Ignoring expiry of an already flushed batch");
                    }
                }

                _ = shutdown.cancelled() => {
                    self.intake_rx.close();
                    while let Some(record) = self.intake_rx.recv().await {
                        self.accept(&mut open, record).await;
                    }
                    break;
                }
            }
        }

        if let Some(remaining) = open.take() {
            remaining.timer.abort();
            self.flush(remaining.batch).await;
        }
        tracing::debug!("Log sink stopped");
    }

    /// Add `record` to the open batch, writing the batch once it is full.
    async fn accept(&mut self, open: &mut Option<OpenBatch>, record: LogRecord) {
        let current = open.get_or_insert_with(|| self.start_batch());
        current.batch.records.push(record);

        if current.batch.records.len() >= self.batch_size {
            if let Some(full) = open.take() {
                full.timer.abort();
                self.flush(full.batch).await;
            }
        }
    }

    fn start_batch(&mut self) -> OpenBatch {
        self.next_batch_id += 1;
        let id = self.next_batch_id;
        let expiry_tx = self.expiry_tx.clone();
        let timeout = self.commit_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expiry_tx.send(id).await;
        });

        OpenBatch {
            batch: LogBatch {
                id,
                records: Vec::with_capacity(self.batch_size),
            },
            timer: timer.abort_handle(),
        }
    }

    async fn flush(&self, batch: LogBatch) {
        let LogBatch { id, records } = batch;
        let count = records.len();
        match self.store.insert_many(records).await {
            Ok(()) => tracing::debug!(batch = id, count, "Flushed log batch"),
            Err(e) => tracing::warn!(batch = id, count, error = %e, "Failed to write log batch"),
        }
    }
}
