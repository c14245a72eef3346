use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
    Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::{CronError, Result};
use crate::store::{
    renewal_interval, CoordinationStore, KeepAliveAck, KeepAliveReceiver, KeyValue, Lease,
    LeaseId, Snapshot, WatchEvent, WatchEventKind, WatchReceiver,
};

/// [`CoordinationStore`] backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured endpoints. Fails if no endpoint answers
    /// within the dial timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| CronError::Store(format!("non-utf8 key: {}", e)))?
        .to_string();
    Ok(KeyValue {
        key,
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
    })
}

/// etcd leases have whole-second TTLs.
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let kvs = resp.kvs().iter().map(convert_kv).collect::<Result<_>>()?;
        Ok(Snapshot { kvs, revision })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let mut options = PutOptions::new().with_prev_key();
        if let Some(id) = lease {
            options = options.with_lease(id);
        }
        let resp = client.put(key, value, Some(options)).await?;
        resp.prev_key().map(convert_kv).transpose()
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await?;
        resp.prev_kvs().first().map(convert_kv).transpose()
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchReceiver> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // The watcher owns the request side of the stream; keep it alive.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "Watch stream failed");
                        break;
                    }
                };
                if resp.canceled() {
                    tracing::warn!(prefix = %prefix, reason = resp.cancel_reason(), "Watch cancelled by server");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let kind = match event.event_type() {
                        EventType::Put => WatchEventKind::Put,
                        EventType::Delete => WatchEventKind::Delete,
                    };
                    let watch_event = WatchEvent {
                        kind,
                        key: key.to_string(),
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision(),
                    };
                    if tx.send(watch_event).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_seconds(ttl), None).await?;
        Ok(Lease {
            id: resp.id(),
            ttl: Duration::from_secs(resp.ttl().max(1) as u64),
        })
    }

    async fn keep_alive(
        &self,
        lease: Lease,
        cancel: CancellationToken,
    ) -> Result<KeepAliveReceiver> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease.id).await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renewal_interval(lease.ttl));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            tracing::warn!(lease = lease.id, error = %e, "Lease renewal request failed");
                            break;
                        }
                        match stream.message().await {
                            Ok(Some(resp)) if resp.ttl() > 0 => {
                                let ttl = Duration::from_secs(resp.ttl() as u64);
                                let _ = tx.try_send(KeepAliveAck { lease: lease.id, ttl });
                            }
                            Ok(_) => {
                                tracing::warn!(lease = lease.id, "Lease expired during renewal");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(lease = lease.id, error = %e, "Lease renewal stream failed");
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
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }
}
