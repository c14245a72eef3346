//! Coordination store contract.
//!
//! Workers only ever talk to the shared store through [`CoordinationStore`]:
//! prefix listing, puts and deletes, watches that resume from a revision,
//! leases with keep-alive, and the single compare-and-swap transaction the
//! job lock needs. [`EtcdStore`] talks to a real etcd cluster;
//! [`MemoryStore`] implements the same semantics in-process.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub type LeaseId = i64;

/// A granted lease. Keys attached to it vanish once it is revoked or goes
/// `ttl` without renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix listing, stamped with the store revision it reflects.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub revision: i64,
}

/// Acknowledgement of one successful lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    pub ttl: Duration,
}

/// Ordered stream of changes under a watched prefix. Closing means the watch
/// is gone and must be re-established by the caller.
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// Renewal acknowledgements. The channel closes when renewal stops, either
/// because the cancel token fired or because the lease could not be renewed.
pub type KeepAliveReceiver = mpsc::Receiver<KeepAliveAck>;

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// List every key under `prefix` together with the current revision.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Write `key`, optionally bound to a lease. Returns the previous value.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<Option<KeyValue>>;

    /// Delete `key`. Returns the removed value, if any.
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Watch `prefix`, delivering every change with revision >= `start_revision`.
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchReceiver>;

    async fn grant_lease(&self, ttl: Duration) -> Result<Lease>;

    /// Keep `lease` alive in the background until `cancel` fires.
    async fn keep_alive(&self, lease: Lease, cancel: CancellationToken)
        -> Result<KeepAliveReceiver>;

    /// Revoke `lease`, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Atomically: if `key` has never been created (create revision 0), put
    /// it bound to `lease` and return true; otherwise leave it and return false.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool>;
}

/// Renewal cadence for a lease: a third of its TTL, so two renewals can be
/// lost before it expires.
pub(crate) fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(1))
}
