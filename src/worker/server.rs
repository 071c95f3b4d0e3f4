use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::protocol::{frame_reader, frame_writer, read_frame, write_frame, JobRequest, WorkerIdentity};
use crate::worker::JobExecutor;

/// A coordinator currently connected to this worker.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub connected_at: DateTime<Utc>,
    pub jobs_completed: u64,
}

/// Accepts coordinator connections and serves build jobs on each.
pub struct WorkerServer {
    identity: WorkerIdentity,
    executor: JobExecutor,
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
}

impl WorkerServer {
    pub fn new(identity: WorkerIdentity, sandbox: SandboxConfig) -> Self {
        Self {
            identity,
            executor: JobExecutor::new(sandbox),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Snapshot of connected coordinators.
    pub async fn peers(&self) -> HashMap<SocketAddr, PeerInfo> {
        self.peers.read().await.clone()
    }

    /// Accept connections until `shutdown` fires, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.identity.id,
            addr = ?listener.local_addr().ok(),
            capacity = self.identity.capacity,
            version = %self.identity.version,
            "Build worker started, waiting for coordinators"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to accept connection");
                }
            }
        }
        tracing::info!(worker_id = %self.identity.id, "Build worker stopped accepting");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.peers.write().await.insert(
            peer,
            PeerInfo {
                connected_at: Utc::now(),
                jobs_completed: 0,
            },
        );
        tracing::info!(peer = %peer, "Coordinator connected");

        self.serve_jobs(stream, peer).await;

        self.peers.write().await.remove(&peer);
    }

    async fn serve_jobs(&self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = frame_reader::<_, JobRequest>(read_half);
        let mut writer = frame_writer(write_half);

        if let Err(e) = write_frame(&mut writer, &self.identity).await {
            tracing::debug!(peer = %peer, error = %e, "Failed to send worker identity");
            return;
        }

        loop {
            let request = match read_frame(&mut reader).await {
                Ok(request) => request,
                Err(e) => {
                    tracing::info!(peer = %peer, reason = %e, "Coordinator disconnected");
                    return;
                }
            };

            tracing::debug!(
                peer = %peer,
                job_id = %request.id,
                environment = %request.environment,
                "Received build request"
            );
            let result = self.executor.execute(&request).await;

            if let Err(e) = write_frame(&mut writer, &result).await {
                tracing::debug!(peer = %peer, job_id = %request.id, error = %e, "Failed to send result");
                return;
            }

            if let Some(info) = self.peers.write().await.get_mut(&peer) {
                info.jobs_completed += 1;
            }
        }
    }
}
