//! MQX queue client
//!
//! Uniform send/receive contracts over several messaging backends:
//! - `QueueConsumer`: pull one message at a time and acknowledge it
//! - `ConsumerLoop`: drives a consumer, maps attributes, applies the ack
//!   policy and calls the handler until cancelled
//! - `QueueSender`: blocking send returning a message id
//!
//! Backends: `stomp`, `ibmmq`, `kafka` (feature), `sqs` (feature).

use async_trait::async_trait;
use bytes::Bytes;

use mqx_common::AttributeSet;

pub mod ack;
pub mod attributes;
pub mod config;
pub mod consumer_loop;
pub mod error;
pub mod handler;
pub mod ibmmq;
pub mod sender;
pub mod stomp;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use ack::{AckPolicy, AckTiming};
pub use attributes::AttributeMapper;
pub use config::ConsumerConfig;
pub use consumer_loop::{
    ConsumerHealthChecker, ConsumerLoop, ConsumerStats, ConsumerStatsSnapshot, LoopExit,
};
pub use error::QueueError;
pub use handler::{ErrorSink, MessageHandler, PayloadTransform, TracingErrorSink, TransformError};
pub use sender::{IdGenerator, UuidGenerator};

pub use mqx_common::{AckMode, Message};

pub type Result<T> = std::result::Result<T, QueueError>;

/// One message as pulled from a backend, before attribute mapping.
#[derive(Debug, Clone)]
pub struct Delivery<R> {
    /// Backend-assigned message id, if the backend has one
    pub id: Option<String>,
    pub payload: Bytes,
    /// Backend-native message handle
    pub raw: R,
}

/// Backend pull primitive driven by a [`ConsumerLoop`].
///
/// A consumer owns its subscription exclusively.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Backend-native message handle carried on every delivery.
    type Raw: Send + Sync + 'static;

    /// Get the unique identifier for this consumer
    fn identifier(&self) -> &str;

    fn config(&self) -> &ConsumerConfig;

    /// Pull at most one message.
    ///
    /// Returns `Ok(None)` when nothing arrived within the backend's wait
    /// window. A backend's "no message available" condition is reported this
    /// way, never as an error.
    async fn poll(&mut self) -> Result<Option<Delivery<Self::Raw>>>;

    /// Normalized attributes of a delivered message.
    fn attributes(&self, raw: &Self::Raw) -> AttributeSet;

    /// Acknowledge (ack, delete or commit) a delivered message.
    async fn ack(&mut self, raw: &Self::Raw) -> Result<()>;
}

/// Publishes messages to a backend.
///
/// `send` performs one synchronous send and never retries. Implementations
/// state whether they may be shared across tasks; those wrapping a
/// connection that is not safe for concurrent use serialize sends.
#[async_trait]
pub trait QueueSender: Send + Sync {
    fn identifier(&self) -> &str;

    /// Send a message and return its id.
    ///
    /// The id is the locally generated one when an [`IdGenerator`] is
    /// configured, otherwise the backend-assigned one, otherwise empty.
    async fn send(&self, destination: &str, payload: Bytes, attributes: &AttributeSet) -> Result<String>;
}
