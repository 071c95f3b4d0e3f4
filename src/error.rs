use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum BoltError {
    #[error("No available workers")]
    NoWorkersAvailable,

    #[error("Worker {0} not found or not connected")]
    WorkerNotFound(String),

    #[error("Worker {0} is currently busy")]
    WorkerBusy(String),

    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error(
        "Version mismatch: coordinator version {coordinator}, worker {worker_id} version {worker}. \
         All components must run the same version"
    )]
    VersionMismatch {
        coordinator: String,
        worker_id: String,
        worker: String,
    },

    #[error("Build timed out after {0:?}")]
    Timeout(Duration),

    #[error("Timed out connecting to {addr} after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("Handshake with {addr} rejected: {reason}")]
    HandshakeRejected { addr: String, reason: String },

    #[error("Connection to worker {0} closed before the build finished")]
    ConnectionClosed(String),

    #[error("Failed to send build request to {addr}: {source}")]
    SendFailed {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to read project files from {path}: {source}")]
    ProjectFiles {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoltError {
    /// HTTP status the dashboard reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BoltError::UnknownEnvironment(_) => 400,
            BoltError::WorkerNotFound(_) => 404,
            BoltError::VersionMismatch { .. } => 409,
            BoltError::NoWorkersAvailable | BoltError::WorkerBusy(_) => 503,
            BoltError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// True for errors raised before any job was sent to a worker.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BoltError::NoWorkersAvailable
                | BoltError::WorkerNotFound(_)
                | BoltError::WorkerBusy(_)
                | BoltError::UnknownEnvironment(_)
                | BoltError::VersionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BoltError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_category() {
        assert_eq!(BoltError::UnknownEnvironment("x".into()).status_code(), 400);
        assert_eq!(BoltError::WorkerNotFound("a:1".into()).status_code(), 404);
        assert_eq!(BoltError::WorkerBusy("a:1".into()).status_code(), 503);
        assert_eq!(BoltError::NoWorkersAvailable.status_code(), 503);
        assert_eq!(
            BoltError::Timeout(Duration::from_secs(1)).status_code(),
            504
        );
        assert_eq!(BoltError::Config("bad".into()).status_code(), 500);
    }

    #[test]
    fn preconditions_are_classified() {
        assert!(BoltError::NoWorkersAvailable.is_precondition());
        assert!(BoltError::VersionMismatch {
            coordinator: "1".into(),
            worker_id: "server-a".into(),
            worker: "2".into(),
        }
        .is_precondition());
        assert!(!BoltError::Timeout(Duration::from_millis(5)).is_precondition());
        assert!(!BoltError::ConnectionClosed("a:1".into()).is_precondition());
    }

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let err = BoltError::VersionMismatch {
            coordinator: "0.1.0".into(),
            worker_id: "server-box".into(),
            worker: "0.0.9".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.1.0"));
        assert!(msg.contains("0.0.9"));
        assert!(msg.contains("server-box"));
    }
}
