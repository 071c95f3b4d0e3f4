use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BoltError, Result};

/// Top-level configuration, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
    pub dashboard: DashboardConfig,
    pub build: BuildConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Port the worker listens on for coordinator connections
    pub port: u16,
    /// Advertised concurrent build capacity (informational)
    pub capacity: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            capacity: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub discovery: DiscoveryConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Ports probed on every candidate address
    pub ports: Vec<u16>,
    pub scan_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on probes in flight during one scan
    pub max_concurrent_probes: usize,
    pub network_range: NetworkRange,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![8080, 8081, 8082, 8083, 8084, 8085],
            scan_interval_ms: 10_000,
            connect_timeout_ms: 2_000,
            max_concurrent_probes: 256,
            network_range: NetworkRange::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// IPv4 range scanned for workers.
///
/// With `auto`, the /24 of the coordinator's outbound address is scanned from
/// .1 to .254. Otherwise `subnet` holds the first three octets (for example
/// `"192.168.1"`) and `start_ip..=end_ip` the host part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRange {
    pub auto: bool,
    pub subnet: String,
    pub start_ip: u32,
    pub end_ip: u32,
}

impl Default for NetworkRange {
    fn default() -> Self {
        Self {
            auto: true,
            subnet: String::new(),
            start_ip: 1,
            end_ip: 254,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a submission waits for its result
    pub build_ms: u64,
    /// Connect timeout used when re-dialing a known worker
    pub reconnect_ms: u64,
    /// Interval between reconnection sweeps
    pub health_check_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_ms: 120_000,
            reconnect_ms: 10_000,
            health_check_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn build(&self) -> Duration {
        Duration::from_millis(self.build_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { port: 8081 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub environments: BTreeMap<String, BuildEnvironment>,
    /// Root for job sandboxes; the OS temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Remove each sandbox once its job finishes
    pub temp_deletion: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            environments: BTreeMap::new(),
            temp_dir: None,
            temp_deletion: true,
        }
    }
}

impl BuildConfig {
    pub fn environment(&self, name: &str) -> Option<&BuildEnvironment> {
        self.environments.get(name)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            temp_root: self.temp_root(),
            cleanup: self.temp_deletion,
        }
    }
}

/// A named build recipe the coordinator turns into job requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildEnvironment {
    /// Language or toolchain label shown on the dashboard
    pub name: String,
    /// Flat command line, split on whitespace by the worker
    pub command: String,
    /// Local source tree shipped with each job; artifacts are written back here
    pub project_dir: PathBuf,
    pub execution_dir: String,
    pub output_paths: Vec<String>,
    pub env_vars: HashMap<String, String>,
    /// Runs on the coordinator after a successful build
    pub post_build_script: Option<String>,
}

/// Where and how the worker materializes jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub temp_root: PathBuf,
    pub cleanup: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir(),
            cleanup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset ("info", "debug", ...)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Where [`Config::load`] got its configuration from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// No file existed; defaults were written to the path.
    CreatedDefault,
}

impl Config {
    /// Load from `path`, writing a default file first if none exists.
    ///
    /// Runs before logging is set up, so callers report the source.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, ConfigSource)> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok((config, ConfigSource::CreatedDefault));
        }

        let data = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&data)?;
        Ok((config, ConfigSource::File))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.port == 0 {
            return Err(BoltError::Config("invalid worker port: 0".into()));
        }
        if self.worker.capacity == 0 {
            return Err(BoltError::Config("invalid worker capacity: 0".into()));
        }
        if self.dashboard.port == 0 {
            return Err(BoltError::Config("invalid dashboard port: 0".into()));
        }

        let discovery = &self.coordinator.discovery;
        if discovery.ports.is_empty() {
            return Err(BoltError::Config("no discovery ports specified".into()));
        }
        if discovery.ports.contains(&0) {
            return Err(BoltError::Config("invalid discovery port: 0".into()));
        }
        if discovery.max_concurrent_probes == 0 {
            return Err(BoltError::Config(
                "max_concurrent_probes must be at least 1".into(),
            ));
        }

        let range = &discovery.network_range;
        if !range.auto {
            if range.subnet.is_empty() {
                return Err(BoltError::Config(
                    "subnet must be specified when auto-detection is disabled".into(),
                ));
            }
            if !(1..=254).contains(&range.start_ip) {
                return Err(BoltError::Config(format!(
                    "invalid start IP: {}",
                    range.start_ip
                )));
            }
            if !(1..=254).contains(&range.end_ip) {
                return Err(BoltError::Config(format!("invalid end IP: {}", range.end_ip)));
            }
            if range.start_ip > range.end_ip {
                return Err(BoltError::Config(
                    "start IP cannot be greater than end IP".into(),
                ));
            }
        }

        if discovery.scan_interval_ms == 0 || discovery.connect_timeout_ms == 0 {
            return Err(BoltError::Config("discovery intervals must be non-zero".into()));
        }
        let timeouts = &self.coordinator.timeouts;
        if timeouts.build_ms == 0 {
            return Err(BoltError::Config("invalid build timeout: 0".into()));
        }
        if timeouts.reconnect_ms == 0 {
            return Err(BoltError::Config("invalid reconnect timeout: 0".into()));
        }
        if timeouts.health_check_ms == 0 {
            return Err(BoltError::Config("invalid health check timeout: 0".into()));
        }

        for (key, env) in &self.build.environments {
            if env.name.is_empty() {
                return Err(BoltError::Config(format!(
                    "name not specified for environment {key}"
                )));
            }
            if env.command.trim().is_empty() {
                return Err(BoltError::Config(format!(
                    "command not specified for environment {key}"
                )));
            }
            if env.project_dir.as_os_str().is_empty() {
                return Err(BoltError::Config(format!(
                    "project directory not specified for environment {key}"
                )));
            }
            if env.execution_dir.is_empty() {
                return Err(BoltError::Config(format!(
                    "execution directory not specified for environment {key}"
                )));
            }
        }

        Ok(())
    }
}
