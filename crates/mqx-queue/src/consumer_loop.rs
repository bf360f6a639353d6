//! Consumer Loop - pull, map, acknowledge, deliver
//!
//! One loop per subscription. Each iteration pulls at most one message,
//! maps its attributes, applies the ack policy, optionally transforms the
//! payload and calls the handler. Pull and ack failures go to the error sink
//! and the loop carries on. A slow handler delays the next pull.
//!
//! The loop stops when its cancellation token fires or the backend reports
//! that the connection is closed.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mqx_common::Message;
use mqx_health::{HealthCheckError, HealthCheckFailure, HealthChecker, HealthData};

use crate::ack::{AckPolicy, AckTiming};
use crate::handler::{ErrorSink, MessageHandler, TracingErrorSink, TransformError};
use crate::{Delivery, QueueConsumer, QueueError};

/// Why a consumer loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    ConnectionClosed(String),
}

enum LoopState<R> {
    Pulling,
    Delivering(Delivery<R>),
    ErrorHandling(QueueError),
}

/// Counters for one consumer loop.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    running: AtomicBool,
    /// Messages pulled from the backend
    polled: AtomicU64,
    /// Pulls that returned no message
    empty_polls: AtomicU64,
    pull_errors: AtomicU64,
    acked: AtomicU64,
    ack_errors: AtomicU64,
    transform_errors: AtomicU64,
    /// Handler invocations that returned an error
    handler_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub running: bool,
    pub polled: u64,
    pub empty_polls: u64,
    pub pull_errors: u64,
    pub acked: u64,
    pub ack_errors: u64,
    pub transform_errors: u64,
    pub handler_errors: u64,
}

impl ConsumerStats {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            running: self.is_running(),
            polled: self.polled.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            pull_errors: self.pull_errors.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drives a [`QueueConsumer`] and hands each message to a handler.
pub struct ConsumerLoop<C, H> {
    consumer: C,
    handler: H,
    policy: AckPolicy,
    error_sink: Arc<dyn ErrorSink>,
    stats: Arc<ConsumerStats>,
}

impl<C, H> ConsumerLoop<C, H>
where
    C: QueueConsumer,
    H: MessageHandler<C::Raw>,
{
    pub fn new(consumer: C, handler: H) -> Self {
        let error_sink = Arc::new(TracingErrorSink::new(consumer.identifier()));
        let policy = consumer.config().ack_policy();
        Self {
            consumer,
            handler,
            policy,
            error_sink,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Replace the default tracing-backed error sink.
    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn identifier(&self) -> &str {
        self.consumer.identifier()
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Shared counters, readable while the loop runs.
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Health checker reporting on this loop.
    pub fn health_checker(&self) -> ConsumerHealthChecker {
        ConsumerHealthChecker::new(self.consumer.identifier(), self.stats.clone())
    }

    /// Run until cancelled or the backend connection closes.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopExit {
        self.stats.running.store(true, Ordering::SeqCst);
        info!(
            consumer = %self.consumer.identifier(),
            destination = %self.consumer.config().destination(),
            ack_mode = %self.policy.mode(),
            ack_on_consume = self.policy.ack_on_consume(),
            "Consumer loop started"
        );

        let exit = self.drive(&cancel).await;

        self.stats.running.store(false, Ordering::SeqCst);
        match &exit {
            LoopExit::Cancelled => {
                info!(consumer = %self.consumer.identifier(), "Consumer loop cancelled");
            }
            LoopExit::ConnectionClosed(reason) => {
                warn!(consumer = %self.consumer.identifier(), reason = %reason, "Consumer loop stopped, connection closed");
            }
        }
        exit
    }

    /// Run on a new task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<LoopExit>
    where
        C: 'static,
        H: 'static,
    {
        tokio::spawn(self.run(cancel))
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> LoopExit {
        let mut state = LoopState::Pulling;

        loop {
            state = match state {
                LoopState::Pulling => {
                    if cancel.is_cancelled() {
                        return LoopExit::Cancelled;
                    }

                    let pulled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return LoopExit::Cancelled,
                        pulled = self.consumer.poll() => pulled,
                    };

                    match pulled {
                        Ok(Some(delivery)) => {
                            ConsumerStats::incr(&self.stats.polled);
                            LoopState::Delivering(delivery)
                        }
                        Ok(None) => {
                            ConsumerStats::incr(&self.stats.empty_polls);
                            LoopState::Pulling
                        }
                        Err(e) if e.is_connection_closed() => {
                            return LoopExit::ConnectionClosed(e.to_string());
                        }
                        Err(e) => LoopState::ErrorHandling(e),
                    }
                }
                LoopState::Delivering(delivery) => {
                    self.deliver(cancel, delivery).await;
                    LoopState::Pulling
                }
                LoopState::ErrorHandling(error) => {
                    ConsumerStats::incr(&self.stats.pull_errors);
                    self.error_sink
                        .report(&format!("receive from {} failed: {}", self.consumer.config().destination(), error));
                    // A backend that fails without awaiting would starve the runtime.
                    tokio::task::yield_now().await;
                    LoopState::Pulling
                }
            };
        }
    }

    async fn deliver(&mut self, cancel: &CancellationToken, delivery: Delivery<C::Raw>) {
        let attributes = self.consumer.attributes(&delivery.raw);

        if self.policy.timing() == AckTiming::BeforeHandler {
            match self.consumer.ack(&delivery.raw).await {
                Ok(()) => ConsumerStats::incr(&self.stats.acked),
                Err(e) => {
                    ConsumerStats::incr(&self.stats.ack_errors);
                    self.error_sink.report(&format!(
                        "ack of message {} on {} failed: {}",
                        delivery.id.as_deref().unwrap_or("<none>"),
                        self.consumer.config().destination(),
                        e
                    ));
                }
            }
        }

        let (payload, transform_error) = match self.consumer.config().transform() {
            Some(transform) => match transform.transform(cancel, delivery.payload.clone()).await {
                Ok(transformed) => (transformed, None),
                Err(e) => {
                    ConsumerStats::incr(&self.stats.transform_errors);
                    (delivery.payload, Some(TransformError(e)))
                }
            },
            None => (delivery.payload, None),
        };

        let message = Message {
            id: delivery.id,
            payload,
            attributes,
            raw: delivery.raw,
        };
        let message_id = message.id.clone();

        if let Err(e) = self.handler.handle(cancel, message, transform_error).await {
            ConsumerStats::incr(&self.stats.handler_errors);
            warn!(
                consumer = %self.consumer.identifier(),
                message_id = ?message_id,
                error = %e,
                "Handler returned an error"
            );
        } else {
            debug!(consumer = %self.consumer.identifier(), message_id = ?message_id, "Message handled");
        }
    }
}

/// Health checker for a running consumer loop.
///
/// Down once the loop has stopped (or before it started); the data carries
/// the loop's counters.
pub struct ConsumerHealthChecker {
    name: String,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHealthChecker {
    pub fn new(name: impl Into<String>, stats: Arc<ConsumerStats>) -> Self {
        Self {
            name: name.into(),
            stats,
        }
    }
}

#[async_trait]
impl HealthChecker for ConsumerHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<HealthData, HealthCheckFailure> {
        let snapshot = self.stats.snapshot();
        let data = match serde_json::to_value(&snapshot) {
            Ok(serde_json::Value::Object(data)) => data,
            Ok(_) => HealthData::new(),
            Err(e) => return Err(HealthCheckError::failed(e.to_string()).into()),
        };
        if !snapshot.running {
            return Err(HealthCheckFailure::new(HealthCheckError::failed("consumer loop is not running")).with_data(data));
        }
        Ok(data)
    }
}
