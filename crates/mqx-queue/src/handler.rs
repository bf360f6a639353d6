//! Caller-supplied collaborators of the consumer loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

use mqx_common::Message;

/// A payload transform failed; the handler receives the original payload.
#[derive(Error, Debug)]
#[error("payload transform failed: {0:#}")]
pub struct TransformError(pub anyhow::Error);

/// Handles messages delivered by a consumer loop.
///
/// `error` is set when the payload transform failed, in which case the
/// message carries the untransformed payload. The returned result is logged
/// and counted but does not change what the loop does next.
#[async_trait]
pub trait MessageHandler<R>: Send + Sync {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        message: Message<R>,
        error: Option<TransformError>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<R, F, Fut> MessageHandler<R> for F
where
    R: Send + 'static,
    F: Fn(CancellationToken, Message<R>, Option<TransformError>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(
        &self,
        ctx: &CancellationToken,
        message: Message<R>,
        error: Option<TransformError>,
    ) -> anyhow::Result<()> {
        (self)(ctx.clone(), message, error).await
    }
}

/// Decodes or re-encodes a payload before the handler sees it.
#[async_trait]
pub trait PayloadTransform: Send + Sync {
    async fn transform(&self, ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<Bytes>;
}

#[async_trait]
impl<F, Fut> PayloadTransform for F
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send,
{
    async fn transform(&self, _ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<Bytes> {
        (self)(payload).await
    }
}

/// Receives diagnostic text for pull and ack failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ErrorSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        (self)(message)
    }
}

/// Error sink that logs through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingErrorSink {
    consumer: String,
}

impl TracingErrorSink {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }
}

impl ErrorSink for TracingErrorSink {
    fn report(&self, message: &str) {
        error!(consumer = %self.consumer, "{}", message);
    }
}
