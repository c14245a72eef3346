use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::jobs::JobStore;
use crate::logs::{JsonLinesLogStore, LogSink, LogStore};
use crate::scheduler::Scheduler;
use crate::store::{CoordinationStore, EtcdStore};
use crate::worker::{Executor, JobWatcher, Registrar};

/// A worker process: every component wired over one store client.
pub struct WorkerNode {
    pub config: WorkerConfig,
    store: Arc<dyn CoordinationStore>,
    log_store: Arc<dyn LogStore>,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CoordinationStore>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            config,
            store,
            log_store,
        }
    }

    /// Connect to etcd and log to the configured JSON-lines file.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(&config.store).await?;
        let log_store = JsonLinesLogStore::new(config.log_sink.path.clone());
        Ok(Self::new(config, Arc::new(store), Arc::new(log_store)))
    }

    /// Control-plane client over the same store.
    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.store.clone(), self.config.keys.clone())
    }

    /// Run the worker until `shutdown` fires.
    ///
    /// Startup is all-or-nothing: invalid config, an unresolvable local
    /// address or a failed initial job listing return an error before any
    /// background task is left running. After that every component handles
    /// its own failures, and shutdown proceeds in dependency order:
    /// 1. The watcher stops feeding events
    /// 2. The scheduler kills in-flight executions and logs their results
    /// 3. The log sink flushes what it holds
    /// 4. The registrar revokes its lease
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let registrar = Registrar::from_config(self.store.clone(), &self.config)?;
        let (sink, logs) = LogSink::new(&self.config.log_sink, self.log_store.clone());
        let executor = Executor::from_config(self.store.clone(), &self.config);
        let (scheduler, handle) = Scheduler::new(executor, logs);
        let watcher = JobWatcher::new(
            self.store.clone(),
            self.config.keys.clone(),
            handle,
            self.config.watch_retry,
        );

        // Bootstrap events queue up until the scheduler starts consuming them.
        let watcher_task = watcher.start(shutdown.clone()).await?;

        let sink_shutdown = CancellationToken::new();
        let sink_task = tokio::spawn(sink.run(sink_shutdown.clone()));
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
        let ip = registrar.ip().to_string();
        let registrar_task = tokio::spawn(registrar.run(shutdown.clone()));

        tracing::info!(ip = %ip, root = %self.config.keys.root(), "Worker started");

        shutdown.cancelled().await;
        tracing::info!("Shutting down worker");

        join("watcher", watcher_task).await;
        join("scheduler", scheduler_task).await;
        sink_shutdown.cancel();
        join("log sink", sink_task).await;
        join("registrar", registrar_task).await;

        tracing::info!("Worker stopped");
        Ok(())
    }
}

async fn join(component: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::error!(component, error = %e, "Task ended abnormally");
    }
}
