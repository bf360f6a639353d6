//! AWS SQS backend (feature `sqs`)

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use mqx_common::AttributeSet;
use mqx_health::{HealthCheckError, HealthCheckFailure, HealthChecker, HealthData};

use crate::attributes::AttributeMapper;
use crate::sender::{generate_id, resolve_id};
use crate::{ConsumerConfig, Delivery, IdGenerator, QueueConsumer, QueueError, QueueSender, Result};

/// Build a client from the default AWS provider chain, optionally against
/// a custom endpoint such as LocalStack.
pub async fn client_from_env(endpoint_url: Option<&str>) -> Client {
    let config = match endpoint_url {
        Some(endpoint_url) => {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .endpoint_url(endpoint_url)
                .load()
                .await
        }
        None => aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await,
    };
    Client::new(&config)
}

/// Maps SQS message attributes to attributes and back.
///
/// String and Number attributes (custom subtypes included) are kept; binary
/// attributes are dropped.
pub struct SqsAttributes;

impl AttributeMapper for SqsAttributes {
    type Native = HashMap<String, MessageAttributeValue>;

    fn to_attributes(native: &Self::Native) -> AttributeSet {
        let mut names: Vec<&String> = native.keys().collect();
        names.sort();

        let mut attributes = AttributeSet::with_capacity(native.len());
        for name in names {
            let value = &native[name];
            let data_type = value.data_type();
            if !(data_type.starts_with("String") || data_type.starts_with("Number")) {
                continue;
            }
            if let Some(text) = value.string_value() {
                attributes.insert(name.as_str(), text);
            }
        }
        attributes
    }

    fn to_native(attributes: &AttributeSet) -> Self::Native {
        attributes
            .iter()
            .filter_map(|(name, value)| {
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .ok()
                    .map(|v| (name.to_string(), v))
            })
            .collect()
    }
}

/// Consumes one SQS queue, one message per receive.
pub struct SqsConsumer {
    identifier: String,
    config: ConsumerConfig,
    client: Client,
    queue_url: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
}

impl SqsConsumer {
    /// Default long poll wait time in seconds. SQS allows at most 20.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

    /// `config.destination()` is the queue URL.
    pub fn new(client: Client, config: ConsumerConfig, visibility_timeout_seconds: i32) -> Self {
        let queue_url = config.destination().to_string();
        let queue_name = queue_url.rsplit('/').next().unwrap_or("unknown");
        Self {
            identifier: format!("sqs:{}", queue_name),
            config,
            client,
            queue_url,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
        }
    }

    /// Set the long poll wait time in seconds, clamped to 0..=20.
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    pub fn wait_time_seconds(&self) -> i32 {
        self.wait_time_seconds
    }
}

#[async_trait]
impl QueueConsumer for SqsConsumer {
    type Raw = SqsMessage;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> Result<Option<Delivery<SqsMessage>>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let message = match result.messages.unwrap_or_default().into_iter().next() {
            Some(message) => message,
            None => return Ok(None),
        };

        debug!(queue = %self.identifier, message_id = ?message.message_id(), "Received SQS message");
        Ok(Some(Delivery {
            id: message.message_id().map(str::to_string),
            payload: Bytes::from(message.body().unwrap_or_default().to_string()),
            raw: message,
        }))
    }

    fn attributes(&self, raw: &SqsMessage) -> AttributeSet {
        raw.message_attributes()
            .map(SqsAttributes::to_attributes)
            .unwrap_or_default()
    }

    async fn ack(&mut self, raw: &SqsMessage) -> Result<()> {
        let receipt_handle = raw
            .receipt_handle()
            .ok_or_else(|| QueueError::Sqs("Missing receipt handle".to_string()))?;

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue = %self.identifier, message_id = ?raw.message_id(), "Message deleted from SQS");
        Ok(())
    }
}

/// Sends to SQS queues; `destination` is the queue URL.
pub struct SqsSender {
    client: Client,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl SqsSender {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            id_generator: None,
        }
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }
}

#[async_trait]
impl QueueSender for SqsSender {
    fn identifier(&self) -> &str {
        "sqs"
    }

    async fn send(&self, destination: &str, payload: Bytes, attributes: &AttributeSet) -> Result<String> {
        let generated = generate_id(self.id_generator.as_ref()).await?;
        let body = String::from_utf8(payload.to_vec())
            .map_err(|_| QueueError::Sqs("SQS message body must be UTF-8".to_string()))?;

        let mut request = self.client.send_message().queue_url(destination).message_body(body);
        if !attributes.is_empty() {
            request = request.set_message_attributes(Some(SqsAttributes::to_native(attributes)));
        }
        let output = request.send().await.map_err(|e| QueueError::Sqs(e.to_string()))?;

        let backend_id = output.message_id().map(str::to_string);
        debug!(queue_url = %destination, message_id = ?backend_id, "Sent SQS message");
        Ok(resolve_id(generated, backend_id))
    }
}

/// Reports approximate visible and in-flight message counts.
pub struct SqsHealthChecker {
    name: String,
    client: Client,
    queue_url: String,
}

impl SqsHealthChecker {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            name: "sqs".to_string(),
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl HealthChecker for SqsHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> std::result::Result<HealthData, HealthCheckFailure> {
        let mut data = HealthData::new();
        data.insert("queue_url".to_string(), self.queue_url.clone().into());

        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| HealthCheckFailure::new(HealthCheckError::failed(e.to_string())).with_data(data.clone()))?;

        let attributes = result.attributes();
        let count = |name: QueueAttributeName| {
            attributes
                .and_then(|attrs| attrs.get(&name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        data.insert(
            "pending_messages".to_string(),
            count(QueueAttributeName::ApproximateNumberOfMessages).into(),
        );
        data.insert(
            "in_flight_messages".to_string(),
            count(QueueAttributeName::ApproximateNumberOfMessagesNotVisible).into(),
        );
        Ok(data)
    }
}
