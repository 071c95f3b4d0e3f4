use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Coordinator, WorkerConnection};
use crate::config::NetworkRange;
use crate::error::{BoltError, Result};
use crate::protocol::{
    frame_reader, read_frame, retarget_reader, FrameReader, JobResult, WorkerIdentity,
};

/// Subnet scanned when auto-detection finds no usable IPv4 address.
const FALLBACK_SUBNET: &str = "192.168.1";

pub(crate) type ResultReader = FrameReader<OwnedReadHalf, JobResult>;

/// Every worker the coordinator has completed a handshake with and not yet
/// lost, keyed by dial address. The reconnection sweep works from this set.
#[derive(Default)]
pub struct DiscoveredWorkers {
    workers: RwLock<HashMap<String, WorkerIdentity>>,
}

impl DiscoveredWorkers {
    pub async fn record(&self, addr: &str, identity: WorkerIdentity) {
        self.workers.write().await.insert(addr.to_string(), identity);
    }

    pub async fn remove(&self, addr: &str) -> Option<WorkerIdentity> {
        self.workers.write().await.remove(addr)
    }

    pub async fn get(&self, addr: &str) -> Option<WorkerIdentity> {
        self.workers.read().await.get(addr).cloned()
    }

    pub async fn snapshot(&self) -> Vec<(String, WorkerIdentity)> {
        let mut workers: Vec<_> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(addr, identity)| (addr.clone(), identity.clone()))
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0));
        workers
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

/// Host addresses covered by `range`. `local` is only consulted in auto mode.
pub fn candidate_hosts(range: &NetworkRange, local: Option<IpAddr>) -> Vec<String> {
    let (prefix, start, end) = if range.auto {
        let prefix = match local {
            Some(IpAddr::V4(ip)) if !ip.is_loopback() => crate::net::subnet_prefix(ip),
            _ => FALLBACK_SUBNET.to_string(),
        };
        (prefix, 1, 254)
    } else {
        (range.subnet.clone(), range.start_ip, range.end_ip)
    };

    (start..=end).map(|host| format!("{prefix}.{host}")).collect()
}

/// Every `host:port` pair one scan probes.
pub fn candidate_addrs(range: &NetworkRange, ports: &[u16], local: Option<IpAddr>) -> Vec<String> {
    candidate_hosts(range, local)
        .into_iter()
        .flat_map(|host| ports.iter().map(move |port| format!("{host}:{port}")))
        .collect()
}

/// Dial `addr` and read the worker's identity, both within `timeout`.
///
/// On success the reader is already switched over to results so no bytes the
/// worker sent after its identity are lost.
pub(crate) async fn handshake(
    addr: &str,
    timeout: Duration,
) -> Result<(WorkerIdentity, ResultReader, OwnedWriteHalf)> {
    let timed_out = || BoltError::ConnectTimeout {
        addr: addr.to_string(),
        after: timeout,
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out())??;
    let (read_half, write_half) = stream.into_split();

    let mut reader = frame_reader::<_, WorkerIdentity>(read_half);
    let identity = tokio::time::timeout(timeout, read_frame(&mut reader))
        .await
        .map_err(|_| timed_out())??;

    Ok((identity, retarget_reader(reader), write_half))
}

impl Coordinator {
    /// Handshake with `addr` and, if it is a build worker, start using it.
    pub async fn connect(
        self: &Arc<Self>,
        addr: &str,
        timeout: Duration,
    ) -> Result<Arc<WorkerConnection>> {
        let (identity, reader, writer) = handshake(addr, timeout).await?;

        if !identity.has_worker_prefix() {
            return Err(BoltError::HandshakeRejected {
                addr: addr.to_string(),
                reason: format!("{} is not a build worker", identity.id),
            });
        }
        if !identity.is_compatible() {
            tracing::warn!(
                addr = %addr,
                worker_id = %identity.id,
                worker_version = %identity.version,
                "Worker version differs from coordinator; builds will be refused"
            );
        }

        let conn = self.attach(addr, identity, reader, writer).await?;
        tracing::info!(
            addr = %addr,
            worker_id = %conn.identity().id,
            capacity = conn.identity().capacity,
            "Discovered build worker"
        );
        Ok(conn)
    }

    /// Re-dial a worker seen before. The worker must present the same id.
    pub async fn reconnect(
        self: &Arc<Self>,
        addr: &str,
        known: &WorkerIdentity,
    ) -> Result<Arc<WorkerConnection>> {
        let timeout = self.config.coordinator.timeouts.reconnect();
        let (identity, reader, writer) = handshake(addr, timeout).await?;

        if identity.id != known.id {
            return Err(BoltError::HandshakeRejected {
                addr: addr.to_string(),
                reason: format!("expected worker {}, found {}", known.id, identity.id),
            });
        }

        let conn = self.attach(addr, identity, reader, writer).await?;
        tracing::info!(addr = %addr, worker_id = %known.id, "Reconnected to build worker");
        Ok(conn)
    }

    /// Probe every candidate address once. Returns how many new workers
    /// were connected.
    pub async fn scan_once(self: &Arc<Self>) -> usize {
        let discovery = &self.config.coordinator.discovery;
        let local = if discovery.network_range.auto {
            crate::net::outbound_local_ip()
        } else {
            None
        };
        let candidates = candidate_addrs(&discovery.network_range, &discovery.ports, local);
        let timeout = discovery.connect_timeout();
        let connected = AtomicUsize::new(0);

        tracing::debug!(candidates = candidates.len(), "Starting discovery scan");

        stream::iter(candidates)
            .for_each_concurrent(discovery.max_concurrent_probes, |addr| {
                let connected = &connected;
                async move {
                    if self.registry.contains(&addr).await {
                        return;
                    }
                    match self.connect(&addr, timeout).await {
                        Ok(_) => {
                            connected.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => tracing::trace!(addr = %addr, error = %e, "Probe failed"),
                    }
                }
            })
            .await;

        connected.into_inner()
    }

    /// Try once to re-dial every known worker without a live connection.
    pub async fn reconnect_sweep(self: &Arc<Self>) -> usize {
        let mut reconnected = 0;
        for (addr, identity) in self.discovered.snapshot().await {
            if self.registry.contains(&addr).await {
                continue;
            }
            match self.reconnect(&addr, &identity).await {
                Ok(_) => reconnected += 1,
                Err(e) => tracing::debug!(addr = %addr, error = %e, "Reconnect failed"),
            }
        }
        reconnected
    }

    /// Scan on every discovery interval, starting immediately.
    pub async fn run_discovery(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.coordinator.discovery.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let found = self.scan_once().await;
                    if found > 0 {
                        tracing::info!(found, "Discovery scan connected new workers");
                    }
                }
            }
        }
        tracing::debug!("Discovery loop stopped");
    }

    /// Re-dial lost workers once per health-check interval.
    pub async fn run_reconnect(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.coordinator.timeouts.health_check();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.reconnect_sweep().await;
                }
            }
        }
        tracing::debug!("Reconnect loop stopped");
    }
}
