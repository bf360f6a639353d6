//! MQX Configuration System
//!
//! TOML configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use mqx_common::AckMode;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Messaging backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Stomp,
    Kafka,
    Sqs,
    Ibmmq,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Stomp => "stomp",
            Backend::Kafka => "kafka",
            Backend::Sqs => "sqs",
            Backend::Ibmmq => "ibmmq",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stomp" => Ok(Backend::Stomp),
            "kafka" => Ok(Backend::Kafka),
            "sqs" => Ok(Backend::Sqs),
            "ibmmq" | "mq" => Ok(Backend::Ibmmq),
            other => Err(format!("unknown backend `{}`", other)),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqxConfig {
    pub backend: Backend,
    pub consumer: ConsumerSection,
    pub stomp: StompSection,
    pub kafka: KafkaSection,
    pub sqs: SqsSection,
    pub ibmmq: IbmMqSection,
    pub health: HealthSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    /// Queue, topic or queue URL, depending on the backend
    pub destination: String,
    pub ack_mode: AckMode,
    /// Acknowledge before the handler runs
    pub ack_on_consume: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StompSection {
    pub address: String,
    pub virtual_host: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Wait for a broker RECEIPT on every send
    pub receipts: bool,
    pub receive_timeout_ms: u64,
    /// Largest frame accepted from the broker, in bytes
    pub max_frame_size: usize,
}

impl Default for StompSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:61613".to_string(),
            virtual_host: "/".to_string(),
            login: None,
            passcode: None,
            receipts: false,
            receive_timeout_ms: 5000,
            max_frame_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSection {
    pub brokers: String,
    pub group_id: String,
    pub client_id: String,
    pub session_timeout_ms: u64,
    pub auto_offset_reset: String,
    pub receive_timeout_ms: u64,
}

impl Default for KafkaSection {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "mqx".to_string(),
            client_id: "mqx".to_string(),
            session_timeout_ms: 30000,
            auto_offset_reset: "earliest".to_string(),
            receive_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsSection {
    /// Custom endpoint, e.g. LocalStack
    pub endpoint_url: Option<String>,
    pub wait_time_seconds: i32,
    pub visibility_timeout_seconds: i32,
}

impl Default for SqsSection {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            wait_time_seconds: 5,
            visibility_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IbmMqSection {
    pub queue_manager: String,
    pub wait_ms: u64,
}

impl Default for IbmMqSection {
    fn default() -> Self {
        Self {
            queue_manager: String::new(),
            wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub probe_timeout_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self { probe_timeout_ms: 5000 }
    }
}

impl MqxConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check the settings the selected backend depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.consumer.destination.trim().is_empty() {
            return invalid("consumer.destination must be set".to_string());
        }
        if self.health.probe_timeout_ms == 0 {
            return invalid("health.probe_timeout_ms must be greater than zero".to_string());
        }

        match self.backend {
            Backend::Stomp => {
                if self.stomp.address.trim().is_empty() {
                    return invalid("stomp.address must be set".to_string());
                }
                if self.stomp.max_frame_size == 0 {
                    return invalid("stomp.max_frame_size must be greater than zero".to_string());
                }
                if self.stomp.login.is_some() != self.stomp.passcode.is_some() {
                    return invalid("stomp.login and stomp.passcode must be set together".to_string());
                }
            }
            Backend::Kafka => {
                if self.kafka.brokers.trim().is_empty() {
                    return invalid("kafka.brokers must be set".to_string());
                }
                if !matches!(self.kafka.auto_offset_reset.as_str(), "earliest" | "latest") {
                    return invalid(format!(
                        "kafka.auto_offset_reset must be `earliest` or `latest`, got `{}`",
                        self.kafka.auto_offset_reset
                    ));
                }
            }
            Backend::Sqs => {
                if !(0..=20).contains(&self.sqs.wait_time_seconds) {
                    return invalid(format!(
                        "sqs.wait_time_seconds must be between 0 and 20, got {}",
                        self.sqs.wait_time_seconds
                    ));
                }
                if self.sqs.visibility_timeout_seconds < 0 {
                    return invalid("sqs.visibility_timeout_seconds must not be negative".to_string());
                }
            }
            Backend::Ibmmq => {
                if self.ibmmq.queue_manager.trim().is_empty() {
                    return invalid("ibmmq.queue_manager must be set".to_string());
                }
            }
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# MQX Configuration
# Environment variables (MQX_*) override these settings

backend = "stomp"

[consumer]
destination = "/queue/orders"
ack_mode = "client-individual"
ack_on_consume = true

[stomp]
address = "127.0.0.1:61613"
virtual_host = "/"
receipts = false
receive_timeout_ms = 5000
max_frame_size = 4194304

[kafka]
brokers = "localhost:9092"
group_id = "mqx"
auto_offset_reset = "earliest"

[sqs]
wait_time_seconds = 5
visibility_timeout_seconds = 30

[health]
probe_timeout_ms = 5000
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_toml_parses_and_validates() {
        let config = MqxConfig::from_toml(&MqxConfig::example_toml()).unwrap();
        assert_eq!(config.backend, Backend::Stomp);
        assert_eq!(config.consumer.ack_mode, AckMode::ClientIndividual);
        assert!(config.consumer.ack_on_consume);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = MqxConfig::from_toml("backend = \"kafka\"").unwrap();
        assert_eq!(config.backend, Backend::Kafka);
        assert_eq!(config.kafka, KafkaSection::default());
        assert_eq!(config.consumer.ack_mode, AckMode::Auto);
        assert!(!config.consumer.ack_on_consume);
    }

    #[test]
    fn test_validate_requires_destination() {
        let err = MqxConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains("destination")));
    }

    #[test]
    fn test_validate_sqs_wait_time() {
        let mut config = MqxConfig::default();
        config.backend = Backend::Sqs;
        config.consumer.destination = "http://localhost:4566/000000000000/orders".to_string();
        config.sqs.wait_time_seconds = 21;
        assert!(config.validate().is_err());
        config.sqs.wait_time_seconds = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ibmmq_needs_queue_manager() {
        let mut config = MqxConfig::default();
        config.backend = Backend::Ibmmq;
        config.consumer.destination = "DEV.QUEUE.1".to_string();
        assert!(config.validate().is_err());
        config.ibmmq.queue_manager = "QM1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("SQS".parse::<Backend>().unwrap(), Backend::Sqs);
        assert_eq!("mq".parse::<Backend>().unwrap(), Backend::Ibmmq);
        assert!("rabbit".parse::<Backend>().is_err());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = MqxConfig::from_toml("backend = [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
