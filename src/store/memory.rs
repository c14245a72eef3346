use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::store::{
    renewal_interval, CoordinationStore, KeepAliveAck, KeepAliveReceiver, KeyValue, Lease,
    LeaseId, Snapshot, WatchEvent, WatchEventKind, WatchReceiver,
};

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    /// Recent events for watch replay, oldest first.
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest revision no longer held in `history`.
    compacted: i64,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if event.key.starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            if let Some(oldest) = self.history.pop_front() {
                self.compacted = oldest.revision;
            }
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Option<KeyValue>> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(CronError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let revision = self.revision;
        let prev = self.kvs.get(key).cloned();

        if let Some(old_lease) = prev.as_ref().and_then(|e| e.lease) {
            if let Some(state) = self.leases.get_mut(&old_lease) {
                state.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(state) = self.leases.get_mut(&id) {
                state.keys.insert(key.to_string());
            }
        }

        let entry = Entry {
            value: value.clone(),
            create_revision: prev.as_ref().map_or(revision, |e| e.create_revision),
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), entry);
        self.emit(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value,
            revision,
        });

        Ok(prev.map(|e| to_key_value(key, &e)))
    }

    fn delete(&mut self, key: &str) -> Option<KeyValue> {
        let removed = self.kvs.remove(key)?;
        if let Some(id) = removed.lease {
            if let Some(state) = self.leases.get_mut(&id) {
                state.keys.remove(key);
            }
        }

        self.revision += 1;
        let revision = self.revision;
        self.emit(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            revision,
        });
        Some(to_key_value(key, &removed))
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(state) = self.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<String> = state.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete(&key);
        }
        true
    }

    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(lease = id, "Lease expired");
            self.drop_lease(id);
        }
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        lease: entry.lease,
    }
}

/// In-process [`CoordinationStore`] with etcd semantics: a global revision
/// counter, watch replay from any past revision, and lease expiry driven by
/// a background reaper task.
///
/// Must be created inside a tokio runtime. The reaper stops once the last
/// clone of the store is dropped.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    pub fn with_reap_interval(reap_interval: Duration) -> Self {
        Self::build(reap_interval, DEFAULT_HISTORY_LIMIT)
    }

    /// Keep only the last `history_limit` events for watch replay. Watches
    /// asking for anything older fail, as they would after an etcd compaction.
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self::build(DEFAULT_REAP_INTERVAL, history_limit)
    }

    fn build(reap_interval: Duration, history_limit: usize) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            history_limit,
            ..Inner::default()
        }));
        tokio::spawn(reap_loop(Arc::downgrade(&inner), reap_interval));
        Self { inner }
    }

    /// Current store revision.
    pub async fn revision(&self) -> i64 {
        self.inner.lock().await.revision
    }

    /// Number of events retained for watch replay.
    pub async fn history_len(&self) -> usize {
        self.inner.lock().await.history.len()
    }

    /// Number of leases currently alive.
    pub async fn lease_count(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    /// Sever every open watch, as a dropped connection would.
    pub async fn close_watches(&self) {
        self.inner.lock().await.watchers.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_loop(inner: Weak<Mutex<Inner>>, reap_interval: Duration) {
    let mut ticker = tokio::time::interval(reap_interval);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.lock().await.reap_expired(Instant::now());
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let inner = self.inner.lock().await;
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| to_key_value(key, entry))
            .collect();
        Ok(Snapshot {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        self.inner.lock().await.put(key, value, lease)
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.inner.lock().await.delete(key))
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        if inner.compacted > 0 && start_revision <= inner.compacted {
            return Err(CronError::Store(format!(
                "required revision {} has been compacted (compacted through {})",
                start_revision, inner.compacted
            )));
        }

        // Replay and registration happen under one lock so nothing slips between.
        for event in inner
            .history
            .iter()
            .filter(|e| e.revision >= start_revision && e.key.starts_with(prefix))
        {
            let _ = tx.send(event.clone());
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        let mut inner = self.inner.lock().await;
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn keep_alive(
        &self,
        lease: Lease,
        cancel: CancellationToken,
    ) -> Result<KeepAliveReceiver> {
        if !self.inner.lock().await.leases.contains_key(&lease.id) {
            return Err(CronError::LeaseNotFound(lease.id));
        }

        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renewal_interval(lease.ttl));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        let renewed = {
                            let mut inner = inner.lock().await;
                            inner.leases.get_mut(&lease.id).map(|state| {
                                state.deadline = Instant::now() + state.ttl;
                                state.ttl
                            })
                        };
                        match renewed {
                            Some(ttl) => {
                                let _ = tx.try_send(KeepAliveAck { lease: lease.id, ttl });
                            }
                            None => {
                                tracing::debug!(lease = lease.id, "Lease gone, stopping renewal");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.inner.lock().await.drop_lease(lease) {
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(lease))
        }
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.put(key, value, Some(lease))?;
        Ok(true)
    }
}
