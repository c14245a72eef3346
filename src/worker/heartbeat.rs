use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{HeartbeatConfig, WorkerConfig};
use crate::error::{CronError, Result};
use crate::keys::{Keyspace, WORKER_ONLINE};
use crate::store::{CoordinationStore, KeepAliveReceiver, Lease};

/// One live registration. Dropping it stops lease renewal.
pub struct Registration {
    pub lease: Lease,
    acks: KeepAliveReceiver,
    _renewal: DropGuard,
}

/// Publishes `workers/<ip>` under a self-renewing lease so the control
/// plane can see which workers are alive.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ip: String,
    config: HeartbeatConfig,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: &Keyspace,
        ip: impl Into<String>,
        config: HeartbeatConfig,
    ) -> Self {
        let ip = ip.into();
        Self {
            store,
            key: keys.worker_key(&ip),
            ip,
            config,
        }
    }

    /// Build from worker config, resolving the local address unless one is
    /// configured.
    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &WorkerConfig) -> Result<Self> {
        let ip = match &config.advertise_ip {
            Some(ip) => ip.clone(),
            None => local_ip()?.to_string(),
        };
        Ok(Self::new(store, &config.keys, ip, config.heartbeat.clone()))
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Grant a lease, start renewing it and publish the worker key.
    pub async fn register_once(&self) -> Result<Registration> {
        let lease = self.store.grant_lease(self.config.lease_ttl).await?;
        let renewal = CancellationToken::new();

        let published = async {
            let acks = self.store.keep_alive(lease, renewal.clone()).await?;
            self.store
                .put(&self.key, WORKER_ONLINE.as_bytes().to_vec(), Some(lease.id))
                .await?;
            Ok::<_, CronError>(acks)
        };

        match published.await {
            Ok(acks) => Ok(Registration {
                lease,
                acks,
                _renewal: renewal.drop_guard(),
            }),
            Err(e) => {
                renewal.cancel();
                if let Err(revoke_err) = self.store.revoke_lease(lease.id).await {
                    tracing::debug!(
                        ip = %self.ip,
                        lease = lease.id,
                        error = %revoke_err,
                        "Failed to revoke lease after failed registration"
                    );
                }
                Err(e)
            }
        }
    }

    /// Stay registered until `shutdown` fires, re-registering after the
    /// configured backoff whenever the lease is lost. On shutdown the lease is
    /// revoked so the worker disappears immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                attempt = self.register_once() => attempt,
                _ = shutdown.cancelled() => break,
            };

            match attempt {
                Ok(mut registration) => {
                    tracing::info!(ip = %self.ip, lease = registration.lease.id, "Worker registered");

                    let lost = loop {
                        tokio::select! {
                            ack = registration.acks.recv() => match ack {
                                Some(ack) => tracing::trace!(lease = ack.lease, ttl = ?ack.ttl, "Heartbeat renewed"),
                                None => break true,
                            },
                            _ = shutdown.cancelled() => break false,
                        }
                    };

                    if !lost {
                        self.deregister(registration).await;
                        return;
                    }
                    tracing::warn!(ip = %self.ip, lease = registration.lease.id, "Heartbeat lease lost");
                }
                Err(e) => tracing::warn!(ip = %self.ip, error = %e, "Worker registration failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::info!(ip = %self.ip, "Heartbeat stopped");
    }

    async fn deregister(&self, registration: Registration) {
        let lease = registration.lease.id;
        drop(registration);
        match self.store.revoke_lease(lease).await {
            Ok(()) => tracing::info!(ip = %self.ip, "Worker deregistered"),
            Err(e) => tracing::warn!(ip = %self.ip, error = %e, "Failed to revoke heartbeat lease"),
        }
    }
}

/// The IPv4 address this host uses for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and source address.
pub fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80").map_err(|_| CronError::NoLocalIp)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(CronError::NoLocalIp);
    }
    Ok(ip)
}
