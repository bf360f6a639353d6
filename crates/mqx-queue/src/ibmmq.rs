//! IBM MQ backend
//!
//! There is no pure-Rust MQI client, so the backend talks to a caller-supplied
//! binding through [`MqQueueManager`]. The binding owns the queue manager
//! connection and object handles; this module owns consume/ack/send
//! semantics on top of it.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use mqx_common::AttributeSet;

use crate::ack::AckTiming;
use crate::attributes::AttributeMapper;
use crate::sender::{generate_id, resolve_id};
use crate::{ConsumerConfig, Delivery, IdGenerator, QueueConsumer, QueueError, QueueSender, Result};

pub const MQCC_OK: i32 = 0;
pub const MQCC_WARNING: i32 = 1;
pub const MQCC_FAILED: i32 = 2;

pub const MQRC_CONNECTION_BROKEN: i32 = 2009;
pub const MQRC_Q_MGR_NAME_ERROR: i32 = 2058;
pub const MQRC_Q_MGR_NOT_AVAILABLE: i32 = 2059;
pub const MQRC_NO_MSG_AVAILABLE: i32 = 2033;
pub const MQRC_Q_MGR_QUIESCING: i32 = 2161;
pub const MQRC_Q_MGR_STOPPING: i32 = 2162;

/// How long a get waits for a message by default.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// A failed MQI call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("IBM MQ {call} failed: completion code {completion_code}, reason {reason}")]
pub struct MqError {
    pub call: String,
    pub completion_code: i32,
    pub reason: i32,
}

impl MqError {
    pub fn new(call: impl Into<String>, completion_code: i32, reason: i32) -> Self {
        Self {
            call: call.into(),
            completion_code,
            reason,
        }
    }

    pub fn is_no_message(&self) -> bool {
        self.reason == MQRC_NO_MSG_AVAILABLE
    }

    /// The queue manager connection is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self.reason,
            MQRC_CONNECTION_BROKEN
                | MQRC_Q_MGR_NOT_AVAILABLE
                | MQRC_Q_MGR_QUIESCING
                | MQRC_Q_MGR_STOPPING
                | MQRC_Q_MGR_NAME_ERROR
        )
    }
}

/// A message property value.
#[derive(Debug, Clone, PartialEq)]
pub enum MqPropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

/// A message returned by [`MqQueueManager::get`].
#[derive(Debug, Clone, Default)]
pub struct MqMessage {
    /// 24-byte message descriptor `MsgId`
    pub msg_id: Vec<u8>,
    pub correl_id: Vec<u8>,
    pub payload: Bytes,
    pub properties: Vec<(String, MqPropertyValue)>,
}

impl MqMessage {
    pub fn msg_id_hex(&self) -> String {
        hex::encode(&self.msg_id)
    }
}

/// A message handed to [`MqQueueManager::put`].
#[derive(Debug, Clone, Default)]
pub struct MqOutgoing {
    pub payload: Bytes,
    pub properties: Vec<(String, MqPropertyValue)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    pub wait: Duration,
    /// Get under syncpoint; the message is removed at the next commit.
    pub syncpoint: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: DEFAULT_WAIT_INTERVAL,
            syncpoint: false,
        }
    }
}

/// The subset of MQI a consumer and sender need.
///
/// Implementations wrap a native binding and must report failures with the
/// MQI completion and reason codes.
#[async_trait]
pub trait MqQueueManager: Send + Sync {
    /// Queue manager name, for identifiers and logs.
    fn name(&self) -> &str;

    /// MQGET with a bounded wait. An empty queue fails with reason 2033.
    async fn get(&self, queue: &str, options: &GetOptions) -> std::result::Result<MqMessage, MqError>;

    /// MQCMIT
    async fn commit(&self) -> std::result::Result<(), MqError>;

    /// MQPUT; returns the `MsgId` the queue manager assigned.
    async fn put(&self, queue: &str, message: MqOutgoing) -> std::result::Result<Vec<u8>, MqError>;
}

/// Maps message properties to attributes and back.
///
/// Strings are kept verbatim and scalars formatted; byte values that are
/// not UTF-8 and nulls are dropped.
pub struct MqProperties;

impl AttributeMapper for MqProperties {
    type Native = Vec<(String, MqPropertyValue)>;

    fn to_attributes(native: &Self::Native) -> AttributeSet {
        let mut attributes = AttributeSet::with_capacity(native.len());
        for (name, value) in native {
            let text = match value {
                MqPropertyValue::String(s) => s.clone(),
                MqPropertyValue::Int(i) => i.to_string(),
                MqPropertyValue::Float(f) => f.to_string(),
                MqPropertyValue::Bool(b) => b.to_string(),
                MqPropertyValue::Bytes(b) => match std::str::from_utf8(b) {
                    Ok(s) => s.to_string(),
                    Err(_) => continue,
                },
                MqPropertyValue::Null => continue,
            };
            attributes.insert_if_absent(name.clone(), text);
        }
        attributes
    }

    fn to_native(attributes: &AttributeSet) -> Self::Native {
        attributes
            .iter()
            .map(|(k, v)| (k.to_string(), MqPropertyValue::String(v.to_string())))
            .collect()
    }
}

/// Consumes one IBM MQ queue.
///
/// Gets run under syncpoint only when the ack policy commits before the
/// handler. The consumer calls the manager without locking, so it needs a
/// manager of its own and must not share one with an [`MqSender`].
pub struct MqConsumer {
    identifier: String,
    config: ConsumerConfig,
    manager: Arc<dyn MqQueueManager>,
    wait: Duration,
}

impl MqConsumer {
    pub fn new(manager: Arc<dyn MqQueueManager>, config: ConsumerConfig) -> Self {
        Self {
            identifier: format!("ibmmq:{}/{}", manager.name(), config.destination()),
            config,
            manager,
            wait: DEFAULT_WAIT_INTERVAL,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn get_options(&self) -> GetOptions {
        GetOptions {
            wait: self.wait,
            syncpoint: self.commits(),
        }
    }

    fn commits(&self) -> bool {
        self.config.ack_policy().timing() == AckTiming::BeforeHandler
    }
}

fn classify(error: MqError) -> QueueError {
    if error.is_connection_lost() {
        QueueError::ConnectionClosed(error.to_string())
    } else {
        QueueError::Mq(error)
    }
}

#[async_trait]
impl QueueConsumer for MqConsumer {
    type Raw = MqMessage;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> Result<Option<Delivery<MqMessage>>> {
        let options = self.get_options();
        match self.manager.get(self.config.destination(), &options).await {
            Ok(message) => Ok(Some(Delivery {
                id: Some(message.msg_id_hex()),
                payload: message.payload.clone(),
                raw: message,
            })),
            Err(e) if e.is_no_message() => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn attributes(&self, raw: &MqMessage) -> AttributeSet {
        MqProperties::to_attributes(&raw.properties)
    }

    async fn ack(&mut self, _raw: &MqMessage) -> Result<()> {
        if !self.commits() {
            return Ok(());
        }
        self.manager.commit().await.map_err(classify)
    }
}

/// Puts messages on IBM MQ queues.
///
/// Connection handles cannot be used from two threads at once, so puts are
/// serialized. The lock only covers this sender; give it a manager that no
/// [`MqConsumer`] uses.
pub struct MqSender {
    identifier: String,
    manager: Arc<dyn MqQueueManager>,
    lock: Mutex<()>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl MqSender {
    pub fn new(manager: Arc<dyn MqQueueManager>) -> Self {
        Self {
            identifier: format!("ibmmq:{}", manager.name()),
            manager,
            lock: Mutex::new(()),
            id_generator: None,
        }
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }
}

#[async_trait]
impl QueueSender for MqSender {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, destination: &str, payload: Bytes, attributes: &AttributeSet) -> Result<String> {
        let generated = generate_id(self.id_generator.as_ref()).await?;
        let message = MqOutgoing {
            payload,
            properties: MqProperties::to_native(attributes),
        };

        let msg_id = {
            let _guard = self.lock.lock().await;
            self.manager.put(destination, message).await?
        };

        let backend_id = if msg_id.is_empty() {
            None
        } else {
            Some(hex::encode(&msg_id))
        };
        debug!(sender = %self.identifier, queue = %destination, msg_id = ?backend_id, "Put IBM MQ message");
        Ok(resolve_id(generated, backend_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_mapping() {
        let native = vec![
            ("name".to_string(), MqPropertyValue::String("order".into())),
            ("count".to_string(), MqPropertyValue::Int(3)),
            ("urgent".to_string(), MqPropertyValue::Bool(true)),
            ("raw".to_string(), MqPropertyValue::Bytes(vec![0xff, 0xfe])),
            ("text".to_string(), MqPropertyValue::Bytes(b"ok".to_vec())),
            ("empty".to_string(), MqPropertyValue::Null),
        ];
        let attributes = MqProperties::to_attributes(&native);
        assert_eq!(attributes.get("name"), Some("order"));
        assert_eq!(attributes.get("count"), Some("3"));
        assert_eq!(attributes.get("urgent"), Some("true"));
        assert_eq!(attributes.get("text"), Some("ok"));
        assert!(!attributes.contains_key("raw"));
        assert!(!attributes.contains_key("empty"));
    }

    #[test]
    fn test_properties_keep_every_attribute() {
        let attributes: AttributeSet = [("tenant", "acme"), ("retries", "3"), ("note", "")]
            .into_iter()
            .collect();
        let native = MqProperties::to_native(&attributes);
        assert!(native.iter().all(|(_, v)| matches!(v, MqPropertyValue::String(_))));
        assert_eq!(MqProperties::to_attributes(&native), attributes);
    }

    #[test]
    fn test_connection_lost_reasons() {
        assert!(MqError::new("MQGET", MQCC_FAILED, MQRC_CONNECTION_BROKEN).is_connection_lost());
        assert!(MqError::new("MQGET", MQCC_FAILED, MQRC_Q_MGR_STOPPING).is_connection_lost());
        assert!(!MqError::new("MQGET", MQCC_FAILED, MQRC_NO_MSG_AVAILABLE).is_connection_lost());
        assert!(MqError::new("MQGET", MQCC_FAILED, MQRC_NO_MSG_AVAILABLE).is_no_message());
    }

    #[test]
    fn test_error_display() {
        let err = MqError::new("MQPUT", MQCC_FAILED, 2053);
        assert_eq!(err.to_string(), "IBM MQ MQPUT failed: completion code 2, reason 2053");
    }
}
