//! Kafka backend (feature `kafka`)

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message as _, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use mqx_common::{AckMode, AttributeSet};
use mqx_health::{HealthCheckError, HealthCheckFailure, HealthChecker, HealthData};

use crate::attributes::AttributeMapper;
use crate::sender::{generate_id, resolve_id};
use crate::{ConsumerConfig, Delivery, IdGenerator, QueueConsumer, QueueError, QueueSender, Result};

/// Attribute carrying the record key.
pub const KEY_ATTRIBUTE: &str = "kafka.key";

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub group_id: String,
    pub client_id: String,
    pub session_timeout: Duration,
    /// `earliest` or `latest`
    pub auto_offset_reset: String,
    /// Longest a poll waits before reporting no message
    pub receive_timeout: Duration,
    /// Delivery timeout for sends
    pub send_timeout: Duration,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "mqx".to_string(),
            client_id: "mqx".to_string(),
            session_timeout: Duration::from_secs(30),
            auto_offset_reset: "earliest".to_string(),
            receive_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl KafkaSettings {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id);
        client_config
    }
}

/// Maps record headers to attributes and back.
///
/// Header values must be UTF-8; null and non-UTF-8 values are dropped.
pub struct KafkaHeaders;

impl AttributeMapper for KafkaHeaders {
    type Native = Option<OwnedHeaders>;

    fn to_attributes(native: &Self::Native) -> AttributeSet {
        let mut attributes = AttributeSet::new();
        if let Some(headers) = native {
            for header in headers.iter() {
                let value = match header.value.map(std::str::from_utf8) {
                    Some(Ok(value)) => value,
                    _ => continue,
                };
                attributes.insert_if_absent(header.key, value);
            }
        }
        attributes
    }

    fn to_native(attributes: &AttributeSet) -> Self::Native {
        let mut headers = OwnedHeaders::new_with_capacity(attributes.len());
        for (key, value) in attributes.iter() {
            if key == KEY_ATTRIBUTE {
                continue;
            }
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }
        Some(headers)
    }
}

/// Consumes one topic as part of a consumer group.
pub struct KafkaConsumer {
    identifier: String,
    config: ConsumerConfig,
    consumer: StreamConsumer,
    receive_timeout: Duration,
}

impl KafkaConsumer {
    /// Create the group consumer and subscribe to the configured topic.
    pub fn new(settings: &KafkaSettings, config: ConsumerConfig) -> Result<Self> {
        let auto_commit = config.ack_mode() == AckMode::Auto;
        let consumer: StreamConsumer = settings
            .client_config()
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", auto_commit.to_string())
            .set("enable.partition.eof", "true")
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("session.timeout.ms", settings.session_timeout.as_millis().to_string())
            .create()
            .map_err(|e| QueueError::Connection(format!("Kafka consumer creation failed: {}", e)))?;

        consumer
            .subscribe(&[config.destination()])
            .map_err(|e| QueueError::Connection(format!("Kafka subscribe failed: {}", e)))?;

        info!(
            brokers = %settings.brokers,
            topic = %config.destination(),
            group_id = %settings.group_id,
            auto_commit,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            identifier: format!("kafka:{}", config.destination()),
            config,
            consumer,
            receive_timeout: settings.receive_timeout,
        })
    }
}

#[async_trait]
impl QueueConsumer for KafkaConsumer {
    type Raw = OwnedMessage;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> Result<Option<Delivery<OwnedMessage>>> {
        let received = match tokio::time::timeout(self.receive_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received,
        };

        match received {
            Ok(message) => {
                let message = message.detach();
                Ok(Some(Delivery {
                    id: None,
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    raw: message,
                }))
            }
            Err(KafkaError::PartitionEOF(partition)) => {
                debug!(topic = %self.config.destination(), partition, "Reached end of partition");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn attributes(&self, raw: &OwnedMessage) -> AttributeSet {
        let mut attributes = KafkaHeaders::to_attributes(&raw.headers().cloned());
        if let Some(key) = raw.key().and_then(|k| std::str::from_utf8(k).ok()) {
            attributes.insert_if_absent(KEY_ATTRIBUTE, key);
        }
        attributes
    }

    async fn ack(&mut self, raw: &OwnedMessage) -> Result<()> {
        let mode = match self.config.ack_mode() {
            AckMode::ClientIndividual => CommitMode::Sync,
            AckMode::ClientCumulative => CommitMode::Async,
            AckMode::Auto | AckMode::None => return Ok(()),
        };

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(raw.topic(), raw.partition(), Offset::Offset(raw.offset() + 1))?;
        self.consumer.commit(&offsets, mode)?;
        Ok(())
    }
}

/// Produces records; shareable across tasks.
pub struct KafkaSender {
    identifier: String,
    producer: FutureProducer,
    send_timeout: Duration,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl KafkaSender {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let producer: FutureProducer = settings
            .client_config()
            .set("retries", "0")
            .set("message.timeout.ms", settings.send_timeout.as_millis().to_string())
            .create()
            .map_err(|e| QueueError::Connection(format!("Kafka producer creation failed: {}", e)))?;

        Ok(Self {
            identifier: format!("kafka:{}", settings.brokers),
            producer,
            send_timeout: settings.send_timeout,
            id_generator: None,
        })
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }
}

#[async_trait]
impl QueueSender for KafkaSender {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, destination: &str, payload: Bytes, attributes: &AttributeSet) -> Result<String> {
        let generated = generate_id(self.id_generator.as_ref()).await?;

        let record = build_record(destination, &payload, attributes);
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| QueueError::Kafka(format!("Kafka send failed: {}", e)))?;

        debug!(topic = %destination, partition, offset, "Produced Kafka record");
        Ok(resolve_id(generated, None))
    }
}

// The `kafka.key` attribute becomes the record key; the rest go out as headers.
fn build_record<'a>(destination: &'a str, payload: &'a [u8], attributes: &'a AttributeSet) -> FutureRecord<'a, str, [u8]> {
    let mut record: FutureRecord<'a, str, [u8]> = FutureRecord::to(destination).payload(payload);
    if let Some(headers) = KafkaHeaders::to_native(attributes) {
        record = record.headers(headers);
    }
    if let Some(key) = attributes.get(KEY_ATTRIBUTE) {
        record = record.key(key);
    }
    record
}

/// Checks broker reachability by fetching topic metadata.
pub struct KafkaHealthChecker {
    name: String,
    topic: String,
    client: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaHealthChecker {
    pub fn new(settings: &KafkaSettings, topic: impl Into<String>) -> Result<Self> {
        let client: BaseConsumer = settings
            .client_config()
            .create()
            .map_err(|e| QueueError::Connection(format!("Kafka client creation failed: {}", e)))?;
        Ok(Self {
            name: "kafka".to_string(),
            topic: topic.into(),
            client: Arc::new(client),
            timeout: Duration::from_secs(3),
        })
    }
}

#[async_trait]
impl HealthChecker for KafkaHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> std::result::Result<HealthData, HealthCheckFailure> {
        let mut data = HealthData::new();
        data.insert("topic".to_string(), self.topic.clone().into());

        let client = self.client.clone();
        let topic = self.topic.clone();
        let timeout = self.timeout;

        let (brokers, partitions) = tokio::task::spawn_blocking(move || {
            let metadata = client.fetch_metadata(Some(&topic), Timeout::After(timeout))?;
            let partitions = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map(|t| t.partitions().len())
                .unwrap_or(0);
            Ok::<_, KafkaError>((metadata.brokers().len(), partitions))
        })
        .await
        .map_err(|e| HealthCheckFailure::new(HealthCheckError::Aborted(e.to_string())).with_data(data.clone()))?
        .map_err(|e| HealthCheckFailure::new(HealthCheckError::failed(e.to_string())).with_data(data.clone()))?;

        data.insert("brokers".to_string(), brokers.into());
        data.insert("partitions".to_string(), partitions.into());
        Ok(data)
    }
}
