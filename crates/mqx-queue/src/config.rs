use std::fmt;
use std::sync::Arc;

use mqx_common::AckMode;

use crate::ack::AckPolicy;
use crate::handler::PayloadTransform;

/// Consumer settings shared by every backend.
///
/// Fixed once built; a consumer and its loop read it for their whole
/// lifetime.
#[derive(Clone)]
pub struct ConsumerConfig {
    destination: String,
    ack_mode: AckMode,
    ack_on_consume: bool,
    transform: Option<Arc<dyn PayloadTransform>>,
}

impl ConsumerConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ack_mode: AckMode::default(),
            ack_on_consume: false,
            transform: None,
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_ack_on_consume(mut self, ack_on_consume: bool) -> Self {
        self.ack_on_consume = ack_on_consume;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn ack_on_consume(&self) -> bool {
        self.ack_on_consume
    }

    pub fn transform(&self) -> Option<&Arc<dyn PayloadTransform>> {
        self.transform.as_ref()
    }

    pub fn ack_policy(&self) -> AckPolicy {
        AckPolicy::new(self.ack_mode, self.ack_on_consume)
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("destination", &self.destination)
            .field("ack_mode", &self.ack_mode)
            .field("ack_on_consume", &self.ack_on_consume)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}
