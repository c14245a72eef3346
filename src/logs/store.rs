use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::logs::record::LogRecord;

/// Destination for flushed log batches.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    async fn insert_many(&self, records: Vec<LogRecord>) -> Result<()>;
}

/// Appends each record as one JSON document per line.
#[derive(Debug, Clone)]
pub struct JsonLinesLogStore {
    path: PathBuf,
    // Serializes appends so lines from concurrent flushes never interleave.
    write_lock: Arc<Mutex<()>>,
}

impl JsonLinesLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogStore for JsonLinesLogStore {
    async fn insert_many(&self, records: Vec<LogRecord>) -> Result<()> {
        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps every flushed batch in memory, in flush order.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    batches: Arc<Mutex<Vec<Vec<LogRecord>>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<Vec<LogRecord>> {
        self.batches.lock().await.clone()
    }

    pub async fn records(&self) -> Vec<LogRecord> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_many(&self, records: Vec<LogRecord>) -> Result<()> {
        self.batches.lock().await.push(records);
        Ok(())
    }
}
