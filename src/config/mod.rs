//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Logging settings
//! - Queue delivery defaults (acknowledge mode, timeouts, limits, put-back)
//! - Cluster replication settings
//! - Environment variable overrides (RELAYMQ_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::hooks::PutBack;
use crate::queue::{AckMode, QueueOptions};

// Re-export cluster config types
pub use cluster::ClusterConfig;

mod cluster;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Default delivery options for new queues
    pub queue: QueueDefaults,
    /// Cluster configuration
    pub cluster: ClusterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Delivery defaults applied to every queue created without explicit options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Acknowledge mode: none, request, wait
    #[serde(default = "default_acknowledge")]
    pub acknowledge: String,
    /// Deadline for a tracked delivery before it is reclaimed
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub acknowledge_timeout: Duration,
    /// Max lifetime of a stored message; absent means no timeout
    #[serde(with = "humantime_serde", default)]
    pub message_timeout: Option<Duration>,
    /// Maximum stored messages per queue, 0 = unlimited
    #[serde(default)]
    pub message_limit: usize,
    /// Maximum subscribers per queue, 0 = unlimited
    #[serde(default)]
    pub client_limit: usize,
    /// Put-back policy for negative acknowledgements: no, start, end
    #[serde(default = "default_put_back")]
    pub put_back: String,
    /// Delay before a put-back re-inserts
    #[serde(with = "humantime_serde", default)]
    pub put_back_delay: Duration,
    /// Store layout: linked (ordered lists) or keyed (unique message ids)
    #[serde(default = "default_store")]
    pub store: String,
}

fn default_acknowledge() -> String {
    "none".to_string()
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_put_back() -> String {
    "end".to_string()
}

fn default_store() -> String {
    "linked".to_string()
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            acknowledge: default_acknowledge(),
            acknowledge_timeout: default_ack_timeout(),
            message_timeout: None,
            message_limit: 0,
            client_limit: 0,
            put_back: default_put_back(),
            put_back_delay: Duration::ZERO,
            store: default_store(),
        }
    }
}

impl QueueDefaults {
    pub fn ack_mode(&self) -> Result<AckMode, ConfigError> {
        match self.acknowledge.as_str() {
            "none" => Ok(AckMode::None),
            "request" => Ok(AckMode::Request),
            "wait" => Ok(AckMode::WaitForAcknowledge),
            other => Err(ConfigError::Validation(format!(
                "acknowledge must be none, request or wait, got '{}'",
                other
            ))),
        }
    }

    pub fn put_back_mode(&self) -> Result<PutBack, ConfigError> {
        match self.put_back.as_str() {
            "no" => Ok(PutBack::No),
            "start" => Ok(PutBack::Start),
            "end" => Ok(PutBack::End),
            other => Err(ConfigError::Validation(format!(
                "put_back must be no, start or end, got '{}'",
                other
            ))),
        }
    }

    /// Resolve into runtime queue options
    pub fn to_queue_options(&self) -> Result<QueueOptions, ConfigError> {
        Ok(QueueOptions {
            acknowledge: self.ack_mode()?,
            acknowledge_timeout: self.acknowledge_timeout,
            message_timeout: self.message_timeout,
            message_limit: self.message_limit,
            client_limit: self.client_limit,
            put_back: self.put_back_mode()?,
            put_back_delay: self.put_back_delay,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__LOG__LEVEL=debug` overrides `log.level`
    ///    - `RELAYMQ__QUEUE__MESSAGE_LIMIT=5000` overrides `queue.message_limit`
    ///    - `RELAYMQ__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("queue.acknowledge", "none")?
            .set_default("queue.acknowledge_timeout", "15s")?
            .set_default("queue.message_limit", 0)?
            .set_default("queue.client_limit", 0)?
            .set_default("queue.put_back", "end")?
            .set_default("queue.put_back_delay", "0s")?
            .set_default("queue.store", "linked")?
            .set_default("cluster.enabled", false)?
            .set_default("cluster.node_id", "")?
            .set_default("cluster.main", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (RELAYMQ__QUEUE__STORE, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Mode strings must resolve
        self.queue.ack_mode()?;
        self.queue.put_back_mode()?;

        match self.queue.store.as_str() {
            "linked" | "keyed" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "store must be linked or keyed, got '{}'",
                    other
                )));
            }
        }

        if self.queue.acknowledge_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "acknowledge_timeout must be greater than zero".to_string(),
            ));
        }

        if self.cluster.enabled {
            if self.cluster.node_id.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.node_id is required when cluster is enabled".to_string(),
                ));
            }
            if self.cluster.peers.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.peers is required when cluster is enabled".to_string(),
                ));
            }
        }

        Ok(())
    }
}
