use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default priority for new jobs; lower values are more urgent.
pub const DEFAULT_PRIORITY: u32 = 65536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Worker configuration, usually loaded from a YAML file. Every field has a
/// default so a file only needs to name what it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Configuration {
    /// Daemon endpoints backing the queue, as `beanstalk://host:port`.
    pub beanstalk_urls: Vec<String>,
    /// Prefix of every tube this worker owns.
    pub tube_namespace: String,
    pub namespace_separator: String,
    /// Queue used for jobs whose handler names none.
    pub primary_queue: String,
    /// Queues to work when none are requested.
    pub default_queues: Vec<String>,
    pub default_priority: u32,
    /// Seconds a handler has before the daemon re-releases its job.
    pub respond_timeout: u32,
    /// Releases allowed before a failing job is buried.
    pub max_job_retries: u32,
    /// Buries allowed before a failing job is dropped; negative is unlimited.
    pub max_job_buries: i64,
    /// Base delay, in seconds, handed to the retry delay function.
    pub retry_delay: u64,
    /// Seconds a reserve waits for a message.
    pub reserve_timeout: u64,
    pub pool: PoolConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            beanstalk_urls: vec!["beanstalk://127.0.0.1:11300".to_owned()],
            tube_namespace: "enchanted.worker".to_owned(),
            namespace_separator: ".".to_owned(),
            primary_queue: "jobs".to_owned(),
            default_queues: Vec::new(),
            default_priority: DEFAULT_PRIORITY,
            respond_timeout: 120,
            max_job_retries: 0,
            max_job_buries: -1,
            retry_delay: 5,
            reserve_timeout: 5,
            pool: PoolConfig::default(),
        }
    }
}

impl Configuration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Prefixes `name` with the tube namespace unless it already carries it.
    pub fn expand_tube_name(&self, name: &str) -> String {
        if self.tube_namespace.is_empty() {
            return name.to_owned();
        }

        let prefix =
            format!("{}{}", self.tube_namespace, self.namespace_separator);

        if name.starts_with(&prefix) {
            name.to_owned()
        } else {
            format!("{prefix}{name}")
        }
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout)
    }

    /// The bury budget, or `None` when buries are unlimited.
    pub fn bury_limit(&self) -> Option<u64> {
        u64::try_from(self.max_job_buries).ok()
    }
}

/// Connection pool tuning.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive failures that open an endpoint's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit keeps its endpoint out of rotation.
    pub circuit_reset_ms: u64,
    /// Attempts `retryable` makes before giving up.
    pub max_attempts: usize,
    /// Rounds over every endpoint made by a reconnect.
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            circuit_reset_ms: 30_000,
            max_attempts: 10,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn circuit_reset(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
