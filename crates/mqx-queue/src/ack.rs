//! Acknowledgment timing.
//!
//! When the consumer is responsible for acknowledging, the ack is sent
//! before the handler runs. A message whose handler is interrupted by a
//! crash is not redelivered.

use mqx_common::AckMode;

/// When the consumer loop acknowledges a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTiming {
    /// Acknowledge, then invoke the handler.
    BeforeHandler,
    /// Never acknowledge explicitly.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    mode: AckMode,
    ack_on_consume: bool,
}

impl AckPolicy {
    pub fn new(mode: AckMode, ack_on_consume: bool) -> Self {
        Self {
            mode,
            ack_on_consume,
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    pub fn ack_on_consume(&self) -> bool {
        self.ack_on_consume
    }

    pub fn timing(&self) -> AckTiming {
        if self.ack_on_consume && self.mode.requires_explicit_ack() {
            AckTiming::BeforeHandler
        } else {
            AckTiming::Never
        }
    }
}
