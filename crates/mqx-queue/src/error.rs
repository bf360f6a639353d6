use thiserror::Error;

use crate::ibmmq::MqError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AWS SQS error: {0}")]
    Sqs(String),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error(transparent)]
    Mq(#[from] MqError),

    #[error("Message id generation failed: {0}")]
    IdGeneration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Consumer is stopped")]
    Stopped,
}

impl QueueError {
    /// Whether the backend connection is gone for good.
    ///
    /// A consumer loop exits on these instead of pulling again.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            QueueError::ConnectionClosed(_) | QueueError::Stopped => true,
            QueueError::Mq(e) => e.is_connection_lost(),
            _ => false,
        }
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for QueueError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        QueueError::Kafka(e.to_string())
    }
}
