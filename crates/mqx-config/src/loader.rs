//! Configuration loader with file and environment variable support

use crate::{ConfigError, MqxConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &["mqx.toml", "./config/mqx.toml", "/etc/mqx/mqx.toml"];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<MqxConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading variables through `lookup`.
    pub fn load_with<F>(&self, lookup: F) -> Result<MqxConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match self.find_config_file(&lookup)? {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                MqxConfig::from_file(&path)?
            }
            None => MqxConfig::default(),
        };

        apply_env_overrides(&mut config, &lookup)?;
        Ok(config)
    }

    /// Find the configuration file to use
    ///
    /// An explicit path must exist; the search paths are optional.
    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::ReadError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {} not found", path.display()),
                )));
            }
            return Ok(Some(path.clone()));
        }

        if let Some(path) = lookup("MQX_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value `{}`", key, value)))
}

/// Apply environment variable overrides
fn apply_env_overrides<F>(config: &mut MqxConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("MQX_BACKEND") {
        config.backend = val.parse().map_err(ConfigError::EnvError)?;
    }

    // Consumer
    if let Some(val) = lookup("MQX_DESTINATION") {
        config.consumer.destination = val;
    }
    if let Some(val) = lookup("MQX_ACK_MODE") {
        config.consumer.ack_mode = val.parse().map_err(ConfigError::EnvError)?;
    }
    if let Some(val) = lookup("MQX_ACK_ON_CONSUME") {
        config.consumer.ack_on_consume = parse("MQX_ACK_ON_CONSUME", &val)?;
    }

    // STOMP
    if let Some(val) = lookup("MQX_STOMP_ADDRESS") {
        config.stomp.address = val;
    }
    if let Some(val) = lookup("MQX_STOMP_VIRTUAL_HOST") {
        config.stomp.virtual_host = val;
    }
    if let Some(val) = lookup("MQX_STOMP_LOGIN") {
        config.stomp.login = Some(val);
    }
    if let Some(val) = lookup("MQX_STOMP_PASSCODE") {
        config.stomp.passcode = Some(val);
    }

    // Kafka
    if let Some(val) = lookup("MQX_KAFKA_BROKERS") {
        config.kafka.brokers = val;
    }
    if let Some(val) = lookup("MQX_KAFKA_GROUP_ID") {
        config.kafka.group_id = val;
    }

    // SQS
    if let Some(val) = lookup("MQX_SQS_ENDPOINT_URL") {
        config.sqs.endpoint_url = Some(val);
    }
    if let Some(val) = lookup("MQX_SQS_WAIT_TIME_SECONDS") {
        config.sqs.wait_time_seconds = parse("MQX_SQS_WAIT_TIME_SECONDS", &val)?;
    }

    // IBM MQ
    if let Some(val) = lookup("MQX_IBMMQ_QUEUE_MANAGER") {
        config.ibmmq.queue_manager = val;
    }

    // Health
    if let Some(val) = lookup("MQX_HEALTH_PROBE_TIMEOUT_MS") {
        config.health.probe_timeout_ms = parse("MQX_HEALTH_PROBE_TIMEOUT_MS", &val)?;
    }

    Ok(())
}
