//! Coordinator: finds workers, keeps connections to them and runs
//! submissions on them.
//!
//! # Architecture
//!
//! - [`ConnectionRegistry`] owns one [`WorkerConnection`] per worker address
//!   and the busy flag that limits each to one job in flight.
//! - [`PendingResults`] correlates job ids with the submitters waiting on
//!   them.
//! - Discovery ([`Coordinator::run_discovery`]) probes the configured network
//!   range on an interval; reconnection ([`Coordinator::run_reconnect`])
//!   re-dials known workers that dropped.
//! - Each connection has a receive task that reads results for as long as
//!   the socket lives and settles the matching pending slot.
//!
//! # Submission Flow
//!
//! 1. Reserve a worker (or fail fast: none idle, not found, busy, version)
//! 2. Register the job id, then write the request
//! 3. Wait for the receive task, the build timeout or a disconnect,
//!    whichever claims the slot first

pub mod connection;
pub mod discovery;
pub mod pending;
pub mod project;
pub mod submit;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{BoltError, Result};
use crate::protocol::{read_frame, WorkerIdentity};

pub use connection::{ConnectionRegistry, WorkerConnection, WorkerStatus};
pub use discovery::DiscoveredWorkers;
pub use pending::PendingResults;
pub use submit::SubmitTarget;

use discovery::ResultReader;

pub struct Coordinator {
    config: Arc<Config>,
    registry: ConnectionRegistry,
    discovered: DiscoveredWorkers,
    pending: PendingResults,
}

impl Coordinator {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ConnectionRegistry::new(),
            discovered: DiscoveredWorkers::default(),
            pending: PendingResults::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn discovered(&self) -> &DiscoveredWorkers {
        &self.discovered
    }

    pub fn pending(&self) -> &PendingResults {
        &self.pending
    }

    /// Start the discovery and reconnection loops.
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_discovery(shutdown.clone())),
            tokio::spawn(self.clone().run_reconnect(shutdown)),
        ]
    }

    /// Status of every live connection, keyed by dial address.
    pub async fn worker_status(&self) -> BTreeMap<String, WorkerStatus> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(|conn| (conn.addr().to_string(), conn.status()))
            .collect()
    }

    /// Register a handshaken connection and start reading its results.
    async fn attach(
        self: &Arc<Self>,
        addr: &str,
        identity: WorkerIdentity,
        reader: ResultReader,
        writer: OwnedWriteHalf,
    ) -> Result<Arc<WorkerConnection>> {
        let conn = Arc::new(WorkerConnection::new(addr, identity.clone(), Box::new(writer)));
        if !self.registry.insert(conn.clone()).await {
            return Err(BoltError::HandshakeRejected {
                addr: addr.to_string(),
                reason: "already connected".to_string(),
            });
        }
        self.discovered.record(addr, identity).await;

        tokio::spawn(self.clone().receive_results(conn.clone(), reader));
        Ok(conn)
    }

    async fn receive_results(self: Arc<Self>, conn: Arc<WorkerConnection>, mut reader: ResultReader) {
        loop {
            match read_frame(&mut reader).await {
                Ok(result) => {
                    let job_id = result.id.clone();
                    if !self.pending.fulfill(result).await {
                        tracing::warn!(
                            addr = %conn.addr(),
                            job_id = %job_id,
                            "Dropping result nobody is waiting for"
                        );
                    }
                    conn.release();
                }
                Err(e) => {
                    tracing::info!(
                        addr = %conn.addr(),
                        worker_id = %conn.identity().id,
                        reason = %e,
                        "Worker disconnected"
                    );
                    break;
                }
            }
        }

        self.detach(&conn).await;
    }

    async fn detach(&self, conn: &Arc<WorkerConnection>) {
        if self.registry.remove(conn).await {
            self.discovered.remove(conn.addr()).await;
        }
        if let Some(job_id) = conn.close() {
            if self.pending.abandon(&job_id).await {
                tracing::warn!(
                    addr = %conn.addr(),
                    job_id = %job_id,
                    "Build lost: worker disconnected while it was running"
                );
            }
        }
    }
}
