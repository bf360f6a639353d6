//! MQX Tail
//!
//! Subscribes to one destination on the configured backend and logs every
//! message until Ctrl+C. With `--health` it probes the backend once, prints
//! the JSON health report and exits non-zero when the backend is down.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mqx_common::Message;
use mqx_config::{Backend, ConfigLoader, MqxConfig};
use mqx_health::{HealthAggregator, HealthChecker};
use mqx_queue::stomp::{StompConsumer, StompHealthChecker, StompSettings};
use mqx_queue::{ConsumerConfig, ConsumerLoop, LoopExit, QueueConsumer, TransformError};

#[derive(Parser, Debug)]
#[command(name = "mqx-tail")]
#[command(about = "Tail a queue or topic and log every message")]
struct Args {
    /// Config file (defaults to MQX_CONFIG, then mqx.toml search paths)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend: stomp, kafka, sqs or ibmmq
    #[arg(long)]
    backend: Option<Backend>,

    /// Queue, topic or queue URL to consume from
    #[arg(long)]
    destination: Option<String>,

    /// Probe backend health once and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    mqx_common::logging::init_logging("mqx-tail");

    let args = Args::parse();
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(destination) = args.destination {
        config.consumer.destination = destination;
    }
    config.validate()?;

    if args.health {
        run_health(&config).await
    } else {
        run_tail(&config).await
    }
}

async fn run_health(config: &MqxConfig) -> Result<()> {
    let checker = health_checker(config).await?;
    let report = HealthAggregator::with_timeout(Duration::from_millis(config.health.probe_timeout_ms))
        .with_checker(checker)
        .check()
        .await;

    println!("{}", report.to_json()?);
    if !report.status.is_up() {
        std::process::exit(1);
    }
    Ok(())
}

async fn health_checker(config: &MqxConfig) -> Result<Arc<dyn HealthChecker>> {
    match config.backend {
        Backend::Stomp => Ok(Arc::new(StompHealthChecker::new(stomp_settings(config)))),
        #[cfg(feature = "kafka")]
        Backend::Kafka => Ok(Arc::new(mqx_queue::kafka::KafkaHealthChecker::new(
            &kafka_settings(config),
            config.consumer.destination.clone(),
        )?)),
        #[cfg(feature = "sqs")]
        Backend::Sqs => {
            let client = mqx_queue::sqs::client_from_env(config.sqs.endpoint_url.as_deref()).await;
            Ok(Arc::new(mqx_queue::sqs::SqsHealthChecker::new(
                client,
                config.consumer.destination.clone(),
            )))
        }
        other => unsupported(other),
    }
}

async fn run_tail(config: &MqxConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received...");
        on_signal.cancel();
    });

    let consumer_config = ConsumerConfig::new(config.consumer.destination.clone())
        .with_ack_mode(config.consumer.ack_mode)
        .with_ack_on_consume(config.consumer.ack_on_consume);

    match config.backend {
        Backend::Stomp => {
            let consumer = StompConsumer::connect(&stomp_settings(config), consumer_config)
                .await?
                .with_receive_timeout(Duration::from_millis(config.stomp.receive_timeout_ms));
            tail(consumer, cancel).await
        }
        #[cfg(feature = "kafka")]
        Backend::Kafka => {
            let consumer = mqx_queue::kafka::KafkaConsumer::new(&kafka_settings(config), consumer_config)?;
            tail(consumer, cancel).await
        }
        #[cfg(feature = "sqs")]
        Backend::Sqs => {
            let client = mqx_queue::sqs::client_from_env(config.sqs.endpoint_url.as_deref()).await;
            let consumer = mqx_queue::sqs::SqsConsumer::new(client, consumer_config, config.sqs.visibility_timeout_seconds)
                .with_wait_time_seconds(config.sqs.wait_time_seconds);
            tail(consumer, cancel).await
        }
        other => unsupported(other),
    }
}

async fn tail<C>(consumer: C, cancel: CancellationToken) -> Result<()>
where
    C: QueueConsumer + 'static,
{
    let handler = |_ctx: CancellationToken, message: Message<C::Raw>, error: Option<TransformError>| async move {
        if let Some(error) = error {
            warn!(message_id = ?message.id, error = %error, "Payload could not be transformed");
        }
        info!(
            message_id = ?message.id,
            attributes = ?message.attributes,
            payload = %String::from_utf8_lossy(&message.payload),
            "Received message"
        );
        Ok::<(), anyhow::Error>(())
    };

    let consumer_loop = ConsumerLoop::new(consumer, handler);
    let stats = consumer_loop.stats();
    info!(consumer = %consumer_loop.identifier(), "Tailing. Press Ctrl+C to stop.");

    let exit = consumer_loop.run(cancel).await;
    info!(stats = ?stats.snapshot(), "Consumer loop finished");

    match exit {
        LoopExit::Cancelled => Ok(()),
        LoopExit::ConnectionClosed(reason) => bail!("connection closed: {}", reason),
    }
}

fn stomp_settings(config: &MqxConfig) -> StompSettings {
    let mut settings = StompSettings::new(config.stomp.address.clone())
        .with_virtual_host(config.stomp.virtual_host.clone())
        .with_max_frame_size(config.stomp.max_frame_size);
    if let (Some(login), Some(passcode)) = (&config.stomp.login, &config.stomp.passcode) {
        settings = settings.with_credentials(login.clone(), passcode.clone());
    }
    settings
}

#[cfg(feature = "kafka")]
fn kafka_settings(config: &MqxConfig) -> mqx_queue::kafka::KafkaSettings {
    mqx_queue::kafka::KafkaSettings {
        brokers: config.kafka.brokers.clone(),
        group_id: config.kafka.group_id.clone(),
        client_id: config.kafka.client_id.clone(),
        session_timeout: Duration::from_millis(config.kafka.session_timeout_ms),
        auto_offset_reset: config.kafka.auto_offset_reset.clone(),
        receive_timeout: Duration::from_millis(config.kafka.receive_timeout_ms),
        ..Default::default()
    }
}

fn unsupported<T>(backend: Backend) -> Result<T> {
    match backend {
        Backend::Ibmmq => bail!("the ibmmq backend needs an application-supplied MqQueueManager binding"),
        other => bail!("backend `{}` is not compiled into this build", other),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
