use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use crate::error::{BoltError, Result};
use crate::protocol::{frame_writer, write_frame, FrameWriter, JobRequest, ProtocolError, WorkerIdentity};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Dashboard view of one live worker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub capacity: u32,
    pub available: bool,
    pub version: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SlotState {
    in_flight: Option<String>,
    closed: bool,
}

/// Coordinator side of one live socket to one worker.
///
/// The in-flight slot doubles as the busy flag: it holds the correlation id
/// of the job currently on the wire, and is empty exactly when the
/// connection can take a new job. Once closed it never takes another.
pub struct WorkerConnection {
    addr: String,
    identity: WorkerIdentity,
    connected_at: DateTime<Utc>,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    slot: Mutex<SlotState>,
}

impl WorkerConnection {
    pub fn new(addr: impl Into<String>, identity: WorkerIdentity, writer: BoxedWriter) -> Self {
        Self {
            addr: addr.into(),
            identity,
            connected_at: Utc::now(),
            writer: tokio::sync::Mutex::new(frame_writer(writer)),
            slot: Mutex::new(SlotState::default()),
        }
    }

    /// Address this connection was dialed on, the registry key.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.slot().in_flight.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }

    pub fn in_flight(&self) -> Option<String> {
        self.slot().in_flight.clone()
    }

    /// Mark busy with `job_id`. Fails if another job is already in flight
    /// or the connection has closed.
    pub fn try_reserve(&self, job_id: &str) -> bool {
        let mut slot = self.slot();
        if slot.closed || slot.in_flight.is_some() {
            return false;
        }
        slot.in_flight = Some(job_id.to_string());
        true
    }

    /// Clear the busy flag, returning the id that was in flight.
    pub fn release(&self) -> Option<String> {
        self.slot().in_flight.take()
    }

    /// Refuse further reservations and hand back the orphaned job id, if any.
    pub fn close(&self) -> Option<String> {
        let mut slot = self.slot();
        slot.closed = true;
        slot.in_flight.take()
    }

    pub async fn send(&self, request: &JobRequest) -> std::result::Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, request).await
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.identity.id.clone(),
            address: self.identity.address.clone(),
            port: self.identity.port,
            capacity: self.identity.capacity,
            available: !self.is_busy(),
            version: self.identity.version.clone(),
            connected_at: self.connected_at,
        }
    }
}

impl fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("addr", &self.addr)
            .field("identity", &self.identity)
            .field("connected_at", &self.connected_at)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Live worker connections keyed by dial address.
///
/// At most one connection per address. Every mutation takes the lock once
/// and never holds it across I/O.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<WorkerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`. Returns false if its address already has a live connection.
    pub async fn insert(&self, conn: Arc<WorkerConnection>) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(conn.addr()) {
            return false;
        }
        connections.insert(conn.addr().to_string(), conn);
        true
    }

    /// Remove `conn` if it is still the registered connection for its address.
    pub async fn remove(&self, conn: &Arc<WorkerConnection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(conn.addr()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(conn.addr());
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.connections.read().await.contains_key(addr)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Look up by dial address, falling back to the worker's advertised
    /// `address:port`.
    pub async fn get(&self, addr: &str) -> Option<Arc<WorkerConnection>> {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(addr) {
            return Some(conn.clone());
        }
        connections
            .values()
            .find(|conn| conn.identity().advertised_addr() == addr)
            .cloned()
    }

    /// All live connections, ordered by address.
    pub async fn snapshot(&self) -> Vec<Arc<WorkerConnection>> {
        let mut connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        connections.sort_by(|a, b| a.addr().cmp(b.addr()));
        connections
    }

    /// Reserve the first idle, version-compatible worker for `job_id`.
    pub async fn reserve_any(&self, job_id: &str) -> Result<Arc<WorkerConnection>> {
        let mut incompatible: Option<Arc<WorkerConnection>> = None;

        for conn in self.snapshot().await {
            if conn.is_busy() || conn.is_closed() {
                continue;
            }
            if !conn.identity().is_compatible() {
                incompatible.get_or_insert(conn);
                continue;
            }
            if conn.try_reserve(job_id) {
                return Ok(conn);
            }
        }

        match incompatible {
            Some(conn) => Err(version_mismatch(conn.identity())),
            None => Err(BoltError::NoWorkersAvailable),
        }
    }

    /// Reserve the worker at `addr` for `job_id`.
    pub async fn reserve_at(&self, addr: &str, job_id: &str) -> Result<Arc<WorkerConnection>> {
        let conn = self
            .get(addr)
            .await
            .ok_or_else(|| BoltError::WorkerNotFound(addr.to_string()))?;

        if !conn.identity().is_compatible() {
            return Err(version_mismatch(conn.identity()));
        }
        if !conn.try_reserve(job_id) {
            return Err(BoltError::WorkerBusy(addr.to_string()));
        }
        Ok(conn)
    }
}

fn version_mismatch(identity: &WorkerIdentity) -> BoltError {
    BoltError::VersionMismatch {
        coordinator: crate::protocol::PROTOCOL_VERSION.to_string(),
        worker_id: identity.id.clone(),
        worker: identity.version.clone(),
    }
}
