//! Build worker runtime.
//!
//! A worker listens for coordinator connections and runs their jobs:
//! - **Handshake**: sends its [`WorkerIdentity`] once per accepted connection
//! - **Execution**: runs jobs one at a time per connection in a sandbox
//!   directory via [`JobExecutor`]
//! - **Artifacts**: returns files matching the job's output patterns
//!
//! # Connection Flow
//!
//! 1. [`WorkerServer::run`] accepts a connection and spawns a task for it
//! 2. The task writes the identity, then loops: decode a `JobRequest`,
//!    execute it, encode the `JobResult`
//! 3. A decode or encode failure ends the loop and deregisters the peer

pub mod artifacts;
pub mod executor;
pub mod server;

use rand::Rng;

use crate::config::WorkerConfig;
use crate::protocol::{WorkerIdentity, PROTOCOL_VERSION, WORKER_ID_PREFIX};

pub use executor::JobExecutor;
pub use server::WorkerServer;

/// `server-<hostname>`, or `server-<random hex>` when no host name is known.
pub fn generate_worker_id() -> String {
    match hostname() {
        Some(host) => format!("{WORKER_ID_PREFIX}{host}"),
        None => {
            let bytes: [u8; 8] = rand::thread_rng().gen();
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("{WORKER_ID_PREFIX}{hex}")
        }
    }
}

fn hostname() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

/// Identity advertised by a worker listening on `port`.
pub fn local_identity(config: &WorkerConfig, port: u16) -> WorkerIdentity {
    WorkerIdentity {
        id: generate_worker_id(),
        address: crate::net::outbound_local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "localhost".to_string()),
        port,
        capacity: config.capacity,
        version: PROTOCOL_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_has_prefix() {
        let id = generate_worker_id();
        assert!(id.starts_with(WORKER_ID_PREFIX));
        assert!(id.len() > WORKER_ID_PREFIX.len());
    }

    #[test]
    fn identity_uses_config_capacity_and_version() {
        let identity = local_identity(
            &WorkerConfig {
                port: 9100,
                capacity: 8,
            },
            9100,
        );
        assert_eq!(identity.port, 9100);
        assert_eq!(identity.capacity, 8);
        assert_eq!(identity.version, PROTOCOL_VERSION);
        assert!(identity.has_worker_prefix());
    }
}
