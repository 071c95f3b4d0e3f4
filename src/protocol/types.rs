use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Version both ends must agree on before a job is accepted.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every worker id starts with this; discovery drops peers that don't.
pub const WORKER_ID_PREFIX: &str = "server-";

/// Sent by a worker exactly once, immediately after accepting a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Advertised only. Each connection still runs one job at a time.
    pub capacity: u32,
    pub version: String,
}

impl WorkerIdentity {
    pub fn has_worker_prefix(&self) -> bool {
        self.id.starts_with(WORKER_ID_PREFIX)
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Address the worker advertises for itself, `address:port`.
    pub fn advertised_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One build job, coordinator to worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    #[serde(default)]
    pub environment: String,
    pub command: String,
    #[serde(default)]
    pub project_dir: String,
    /// Relative to the sandbox unless absolute; empty means the sandbox root.
    #[serde(default)]
    pub execution_dir: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub output_paths: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub env_vars: HashMap<String, String>,
    /// Relative path (forward slashes) to file content.
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: HashMap<String, String>,
    /// Sandbox directory name under the worker's temp root.
    pub project_name: String,
}

/// Outcome of one job, worker to coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, with = "duration_nanos")]
    pub duration: Duration,
    /// Normalized `./`-prefixed path to base64 content.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub output_files: HashMap<String, String>,
}

impl JobResult {
    pub fn failed(id: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: error.into(),
            duration,
            ..Default::default()
        }
    }
}

/// Peers written in other languages send `null` for empty maps and lists.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Durations travel as integer nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
