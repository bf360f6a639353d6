//! STOMP 1.2 backend
//!
//! Works against any STOMP 1.2 broker (ActiveMQ, Artemis, RabbitMQ with the
//! STOMP plugin). One TCP connection per consumer or sender.

mod connection;
mod frame;

pub use connection::{ServerInfo, StompConnection, StompSettings};
pub use frame::{Command, Frame, DEFAULT_MAX_FRAME_SIZE};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use mqx_common::{AckMode, AttributeSet};
use mqx_health::{HealthCheckError, HealthCheckFailure, HealthChecker, HealthData};

use crate::attributes::AttributeMapper;
use crate::sender::{generate_id, resolve_id};
use crate::{ConsumerConfig, Delivery, IdGenerator, QueueConsumer, QueueError, QueueSender, Result};
use connection::error_text;

/// How long a single poll waits for a frame before reporting no message.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

const SUBSCRIPTION_ID: &str = "0";

/// Maps STOMP frame headers to attributes and back.
pub struct StompHeaders;

impl AttributeMapper for StompHeaders {
    type Native = Vec<(String, String)>;

    fn to_attributes(native: &Self::Native) -> AttributeSet {
        let mut attributes = AttributeSet::with_capacity(native.len());
        for (key, value) in native {
            attributes.insert_if_absent(key.clone(), value.clone());
        }
        attributes
    }

    fn to_native(attributes: &AttributeSet) -> Self::Native {
        attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

fn subscribe_ack_header(mode: AckMode) -> &'static str {
    match mode {
        AckMode::Auto | AckMode::None => "auto",
        AckMode::ClientCumulative => "client",
        AckMode::ClientIndividual => "client-individual",
    }
}

/// Consumes one STOMP destination through a single subscription.
pub struct StompConsumer<S = TcpStream> {
    identifier: String,
    config: ConsumerConfig,
    connection: StompConnection<S>,
    receive_timeout: Duration,
    closed: bool,
}

impl StompConsumer<TcpStream> {
    /// Connect, handshake and subscribe.
    pub async fn connect(settings: &StompSettings, config: ConsumerConfig) -> Result<Self> {
        let (connection, info) = StompConnection::connect(settings).await?;
        info!(
            address = %settings.address,
            destination = %config.destination(),
            server = ?info.server,
            "Connected STOMP consumer"
        );
        Self::subscribe(connection, config).await
    }
}

impl<S> StompConsumer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Subscribe on an already established connection.
    pub async fn subscribe(mut connection: StompConnection<S>, config: ConsumerConfig) -> Result<Self> {
        let subscribe = Frame::new(Command::Subscribe)
            .header("id", SUBSCRIPTION_ID)
            .header("destination", config.destination())
            .header("ack", subscribe_ack_header(config.ack_mode()));
        connection.write_frame(&subscribe).await?;

        Ok(Self {
            identifier: format!("stomp:{}", config.destination()),
            config,
            connection,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            closed: false,
        })
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Unsubscribe and disconnect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let unsubscribe = Frame::new(Command::Unsubscribe).header("id", SUBSCRIPTION_ID);
        let _ = self.connection.write_frame(&unsubscribe).await;
        self.connection.disconnect().await;
    }
}

#[async_trait]
impl<S> QueueConsumer for StompConsumer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Raw = Frame;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> Result<Option<Delivery<Frame>>> {
        if self.closed {
            return Err(QueueError::Stopped);
        }

        let frame = match tokio::time::timeout(self.receive_timeout, self.connection.read_frame()).await {
            Err(_) => return Ok(None),
            Ok(read) => read?,
        };

        let frame = match frame {
            Some(frame) => frame,
            None => {
                self.closed = true;
                return Err(QueueError::ConnectionClosed("broker closed the STOMP connection".to_string()));
            }
        };

        match frame.command {
            Command::Message => Ok(Some(Delivery {
                id: frame.get_header("message-id").map(str::to_string),
                payload: frame.body.clone(),
                raw: frame,
            })),
            Command::Receipt => {
                debug!(receipt = ?frame.get_header("receipt-id"), "Ignoring RECEIPT frame");
                Ok(None)
            }
            Command::Error => Err(QueueError::Protocol(error_text(&frame))),
            other => Err(QueueError::Protocol(format!("unexpected {} frame from broker", other))),
        }
    }

    fn attributes(&self, raw: &Frame) -> AttributeSet {
        StompHeaders::to_attributes(&raw.headers)
    }

    async fn ack(&mut self, raw: &Frame) -> Result<()> {
        if !self.config.ack_mode().requires_explicit_ack() {
            return Ok(());
        }

        let message_id = raw.get_header("message-id").unwrap_or_default();
        let ack_id = raw.get_header("ack").unwrap_or(message_id);
        let subscription = raw.get_header("subscription").unwrap_or(SUBSCRIPTION_ID);
        let ack = Frame::new(Command::Ack)
            .header("id", ack_id)
            .header("message-id", message_id)
            .header("subscription", subscription);
        self.connection.write_frame(&ack).await
    }
}

/// Sends to STOMP destinations over one shared connection.
///
/// Safe to share across tasks; sends are serialized. The `destination`,
/// `content-length` and `receipt` headers are set by the sender, so
/// attributes with those names are not sent.
pub struct StompSender<S = TcpStream> {
    identifier: String,
    connection: Mutex<StompConnection<S>>,
    receipts: bool,
    next_receipt: AtomicU64,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl StompSender<TcpStream> {
    pub async fn connect(settings: &StompSettings) -> Result<Self> {
        let (connection, info) = StompConnection::connect(settings).await?;
        info!(address = %settings.address, server = ?info.server, "Connected STOMP sender");
        Ok(Self::new(format!("stomp:{}", settings.address), connection))
    }
}

impl<S> StompSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(identifier: impl Into<String>, connection: StompConnection<S>) -> Self {
        Self {
            identifier: identifier.into(),
            connection: Mutex::new(connection),
            receipts: false,
            next_receipt: AtomicU64::new(1),
            id_generator: None,
        }
    }

    /// Ask the broker for a RECEIPT on every send and wait for it.
    pub fn with_receipts(mut self, receipts: bool) -> Self {
        self.receipts = receipts;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    pub async fn close(&self) {
        self.connection.lock().await.disconnect().await;
    }
}

#[async_trait]
impl<S> QueueSender for StompSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, destination: &str, payload: Bytes, attributes: &AttributeSet) -> Result<String> {
        let generated = generate_id(self.id_generator.as_ref()).await?;

        let mut frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-length", payload.len().to_string());
        for (key, value) in StompHeaders::to_native(attributes) {
            if key == "destination" || key == "content-length" || key == "receipt" {
                continue;
            }
            frame.push_header(key, value);
        }
        let receipt_id = if self.receipts {
            let id = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
            frame.push_header("receipt", id.as_str());
            Some(id)
        } else {
            None
        };
        let frame = frame.body(payload);

        let mut connection = self.connection.lock().await;
        connection.write_frame(&frame).await?;

        if let Some(receipt_id) = receipt_id {
            loop {
                let reply = connection.read_frame().await?.ok_or_else(|| {
                    QueueError::ConnectionClosed("broker closed the connection before sending a receipt".to_string())
                })?;
                match reply.command {
                    Command::Receipt if reply.get_header("receipt-id") == Some(receipt_id.as_str()) => break,
                    Command::Error => return Err(QueueError::Protocol(error_text(&reply))),
                    _ => continue,
                }
            }
        }

        debug!(sender = %self.identifier, destination = %destination, "Sent STOMP message");
        Ok(resolve_id(generated, None))
    }
}

/// Checks that the broker accepts a STOMP session.
pub struct StompHealthChecker {
    name: String,
    settings: StompSettings,
}

impl StompHealthChecker {
    pub fn new(settings: StompSettings) -> Self {
        Self {
            name: "stomp".to_string(),
            settings,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl HealthChecker for StompHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> std::result::Result<HealthData, HealthCheckFailure> {
        let mut data = HealthData::new();
        data.insert("address".to_string(), self.settings.address.clone().into());

        let (mut connection, info) = StompConnection::connect(&self.settings)
            .await
            .map_err(|e| HealthCheckFailure::new(HealthCheckError::failed(e.to_string())).with_data(data.clone()))?;
        connection.disconnect().await;

        if let Some(server) = info.server {
            data.insert("server".to_string(), server.into());
        }
        if let Some(version) = info.version {
            data.insert("version".to_string(), version.into());
        }
        Ok(data)
    }
}
