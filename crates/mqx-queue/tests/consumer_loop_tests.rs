//! ConsumerLoop Tests
//!
//! Tests for:
//! - Ack policy timing (never / before the handler)
//! - Empty polls and pull failures
//! - Ack failures
//! - Payload transforms
//! - Cancellation and connection loss
//! - Consumer health reporting

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mqx_common::{AckMode, AttributeSet, Message};
use mqx_health::{HealthChecker, HealthStatus};
use mqx_queue::{
    ConsumerConfig, ConsumerLoop, Delivery, ErrorSink, LoopExit, PayloadTransform, QueueConsumer,
    QueueError, TransformError,
};

enum Step {
    Message(&'static str),
    Empty,
    Fail(&'static str),
}

/// What the mock does once its script is used up.
#[derive(Clone, Copy)]
enum End {
    Closed,
    Block,
}

type Events = Arc<Mutex<Vec<String>>>;

struct ScriptedConsumer {
    config: ConsumerConfig,
    script: VecDeque<Step>,
    end: End,
    failing_acks: Vec<&'static str>,
    events: Events,
}

impl ScriptedConsumer {
    fn new(config: ConsumerConfig, script: Vec<Step>, end: End, events: Events) -> Self {
        Self {
            config,
            script: script.into(),
            end,
            failing_acks: Vec::new(),
            events,
        }
    }

    fn failing_ack(mut self, id: &'static str) -> Self {
        self.failing_acks.push(id);
        self
    }
}

#[async_trait]
impl QueueConsumer for ScriptedConsumer {
    type Raw = String;

    fn identifier(&self) -> &str {
        "scripted"
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> mqx_queue::Result<Option<Delivery<String>>> {
        tokio::task::yield_now().await;
        match self.script.pop_front() {
            Some(Step::Message(id)) => Ok(Some(Delivery {
                id: Some(id.to_string()),
                payload: Bytes::from(format!("payload-{}", id)),
                raw: id.to_string(),
            })),
            Some(Step::Empty) => Ok(None),
            Some(Step::Fail(reason)) => Err(QueueError::Protocol(reason.to_string())),
            None => match self.end {
                End::Closed => Err(QueueError::ConnectionClosed("script exhausted".to_string())),
                End::Block => std::future::pending().await,
            },
        }
    }

    fn attributes(&self, raw: &String) -> AttributeSet {
        [("source-id", raw.as_str())].into_iter().collect()
    }

    async fn ack(&mut self, raw: &String) -> mqx_queue::Result<()> {
        self.events.lock().push(format!("ack:{}", raw));
        if self.failing_acks.contains(&raw.as_str()) {
            return Err(QueueError::Protocol("ack rejected".to_string()));
        }
        Ok(())
    }
}

/// Fails every pull without ever awaiting.
struct FailingConsumer {
    config: ConsumerConfig,
}

#[async_trait]
impl QueueConsumer for FailingConsumer {
    type Raw = String;

    fn identifier(&self) -> &str {
        "failing"
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&mut self) -> mqx_queue::Result<Option<Delivery<String>>> {
        Err(QueueError::Protocol("malformed frame".to_string()))
    }

    fn attributes(&self, _raw: &String) -> AttributeSet {
        AttributeSet::new()
    }

    async fn ack(&mut self, _raw: &String) -> mqx_queue::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Handled {
    id: Option<String>,
    payload: Bytes,
    attributes: AttributeSet,
    transform_error: Option<String>,
}

struct Harness {
    events: Events,
    handled: Arc<Mutex<Vec<Handled>>>,
    reports: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            handled: Arc::new(Mutex::new(Vec::new())),
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn consumer(&self, config: ConsumerConfig, script: Vec<Step>, end: End) -> ScriptedConsumer {
        ScriptedConsumer::new(config, script, end, self.events.clone())
    }

    fn build(
        &self,
        consumer: ScriptedConsumer,
        handler_fails: bool,
    ) -> ConsumerLoop<
        ScriptedConsumer,
        impl Fn(CancellationToken, Message<String>, Option<TransformError>) -> futures::future::Ready<anyhow::Result<()>>
            + Send
            + Sync,
    > {
        let events = self.events.clone();
        let handled = self.handled.clone();
        let handler = move |_ctx: CancellationToken, message: Message<String>, error: Option<TransformError>| {
            events
                .lock()
                .push(format!("handle:{}", message.id.clone().unwrap_or_default()));
            handled.lock().push(Handled {
                id: message.id,
                payload: message.payload,
                attributes: message.attributes,
                transform_error: error.map(|e| e.to_string()),
            });
            if handler_fails {
                futures::future::ready(Err(anyhow::anyhow!("handler failed")))
            } else {
                futures::future::ready(Ok(()))
            }
        };

        let reports = self.reports.clone();
        let sink: Arc<dyn ErrorSink> = Arc::new(move |message: &str| reports.lock().push(message.to_string()));
        ConsumerLoop::new(consumer, handler).with_error_sink(sink)
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

fn config(mode: AckMode, ack_on_consume: bool) -> ConsumerConfig {
    ConsumerConfig::new("orders")
        .with_ack_mode(mode)
        .with_ack_on_consume(ack_on_consume)
}

#[tokio::test]
async fn test_no_ack_when_ack_on_consume_disabled() {
    let harness = Harness::new();
    let consumer = harness.consumer(
        config(AckMode::ClientIndividual, false),
        vec![Step::Message("m1"), Step::Message("m2")],
        End::Closed,
    );

    let exit = harness.build(consumer, false).run(CancellationToken::new()).await;

    assert!(matches!(exit, LoopExit::ConnectionClosed(_)));
    assert_eq!(harness.events(), vec!["handle:m1", "handle:m2"]);
}

#[tokio::test]
async fn test_ack_happens_before_handler() {
    let harness = Harness::new();
    let consumer = harness.consumer(
        config(AckMode::ClientIndividual, true),
        vec![Step::Message("m1"), Step::Message("m2")],
        End::Closed,
    );

    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    assert_eq!(harness.events(), vec!["ack:m1", "handle:m1", "ack:m2", "handle:m2"]);
    assert_eq!(stats.snapshot().acked, 2);
}

#[tokio::test]
async fn test_auto_and_none_modes_never_ack() {
    for mode in [AckMode::Auto, AckMode::None] {
        let harness = Harness::new();
        let consumer = harness.consumer(config(mode, true), vec![Step::Message("m1")], End::Closed);

        harness.build(consumer, false).run(CancellationToken::new()).await;

        assert_eq!(harness.events(), vec!["handle:m1"], "mode {}", mode);
    }
}

#[tokio::test]
async fn test_empty_polls_are_not_errors() {
    let harness = Harness::new();
    let consumer = harness.consumer(
        config(AckMode::Auto, false),
        vec![Step::Empty, Step::Empty, Step::Empty, Step::Message("m1")],
        End::Closed,
    );

    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    assert_eq!(harness.handled.lock().len(), 1);
    assert!(harness.reports.lock().is_empty());
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.empty_polls, 3);
    assert_eq!(snapshot.polled, 1);
}

#[tokio::test]
async fn test_pull_failure_is_reported_and_loop_continues() {
    let harness = Harness::new();
    let consumer = harness.consumer(
        config(AckMode::Auto, false),
        vec![Step::Fail("broker hiccup"), Step::Message("m1")],
        End::Closed,
    );

    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    let reports = harness.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("orders"));
    assert!(reports[0].contains("broker hiccup"));
    assert_eq!(harness.handled.lock().len(), 1);
    assert_eq!(stats.snapshot().pull_errors, 1);
}

#[tokio::test]
async fn test_ack_failure_still_invokes_handler() {
    let harness = Harness::new();
    let consumer = harness
        .consumer(
            config(AckMode::ClientCumulative, true),
            vec![Step::Message("m1"), Step::Message("m2")],
            End::Closed,
        )
        .failing_ack("m1");

    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    assert_eq!(harness.events(), vec!["ack:m1", "handle:m1", "ack:m2", "handle:m2"]);
    let reports = harness.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("m1"));
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.ack_errors, 1);
    assert_eq!(snapshot.acked, 1);
}

#[tokio::test]
async fn test_message_carries_mapped_attributes() {
    let harness = Harness::new();
    let consumer = harness.consumer(config(AckMode::Auto, false), vec![Step::Message("m1")], End::Closed);

    harness.build(consumer, false).run(CancellationToken::new()).await;

    let handled = harness.handled.lock();
    assert_eq!(handled[0].id.as_deref(), Some("m1"));
    assert_eq!(handled[0].attributes.get("source-id"), Some("m1"));
    assert_eq!(&handled[0].payload[..], b"payload-m1");
}

#[tokio::test]
async fn test_transform_is_applied() {
    let harness = Harness::new();
    let upper: Arc<dyn PayloadTransform> =
        Arc::new(|payload: Bytes| async move { Ok::<_, anyhow::Error>(Bytes::from(payload.to_ascii_uppercase())) });
    let consumer = harness.consumer(
        config(AckMode::Auto, false).with_transform(upper),
        vec![Step::Message("m1")],
        End::Closed,
    );

    harness.build(consumer, false).run(CancellationToken::new()).await;

    let handled = harness.handled.lock();
    assert_eq!(&handled[0].payload[..], b"PAYLOAD-M1");
    assert!(handled[0].transform_error.is_none());
}

#[tokio::test]
async fn test_transform_error_is_forwarded_with_original_payload() {
    let harness = Harness::new();
    let broken: Arc<dyn PayloadTransform> =
        Arc::new(|_payload: Bytes| async move { Err::<Bytes, _>(anyhow::anyhow!("not gzip")) });
    let consumer = harness.consumer(
        config(AckMode::Auto, false).with_transform(broken),
        vec![Step::Message("m1")],
        End::Closed,
    );

    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    let handled = harness.handled.lock();
    assert_eq!(handled.len(), 1);
    assert_eq!(&handled[0].payload[..], b"payload-m1");
    assert_eq!(
        handled[0].transform_error.as_deref(),
        Some("payload transform failed: not gzip")
    );
    assert!(harness.reports.lock().is_empty());
    assert_eq!(stats.snapshot().transform_errors, 1);
}

#[tokio::test]
async fn test_handler_error_does_not_stop_loop() {
    let harness = Harness::new();
    let consumer = harness.consumer(
        config(AckMode::Auto, false),
        vec![Step::Message("m1"), Step::Message("m2")],
        End::Closed,
    );

    let consumer_loop = harness.build(consumer, true);
    let stats = consumer_loop.stats();
    consumer_loop.run(CancellationToken::new()).await;

    assert_eq!(harness.handled.lock().len(), 2);
    assert!(harness.reports.lock().is_empty());
    assert_eq!(stats.snapshot().handler_errors, 2);
}

#[tokio::test]
async fn test_cancellation_interrupts_blocking_pull() {
    let harness = Harness::new();
    let consumer = harness.consumer(config(AckMode::Auto, false), vec![Step::Message("m1")], End::Block);

    let cancel = CancellationToken::new();
    let consumer_loop = harness.build(consumer, false);
    let stats = consumer_loop.stats();
    let handle = consumer_loop.spawn(cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.handled.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(exit, LoopExit::Cancelled);
    assert!(!stats.is_running());
}

#[tokio::test]
async fn test_cancelled_before_start_never_polls() {
    let harness = Harness::new();
    let consumer = harness.consumer(config(AckMode::Auto, false), vec![Step::Message("m1")], End::Closed);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let exit = harness.build(consumer, false).run(cancel).await;

    assert_eq!(exit, LoopExit::Cancelled);
    assert!(harness.handled.lock().is_empty());
}

#[tokio::test]
async fn test_health_checker_follows_loop_state() {
    let harness = Harness::new();
    let consumer = harness.consumer(config(AckMode::Auto, false), vec![Step::Message("m1")], End::Block);

    let cancel = CancellationToken::new();
    let consumer_loop = harness.build(consumer, false);
    let checker = consumer_loop.health_checker();
    assert!(checker.check().await.is_err());

    let handle = consumer_loop.spawn(cancel.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.handled.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let data = checker.check().await.unwrap();
    assert_eq!(data["running"], serde_json::json!(true));
    assert_eq!(data["polled"], serde_json::json!(1));

    cancel.cancel();
    handle.await.unwrap();

    let report = mqx_health::HealthAggregator::new()
        .with_checker(Arc::new(checker))
        .check()
        .await;
    assert_eq!(report.status, HealthStatus::Down);

    // Counters gathered before the failure stay in the report.
    let data = report.detail("scripted").unwrap().data.clone().unwrap();
    assert_eq!(data["polled"], serde_json::json!(1));
    assert_eq!(data["running"], serde_json::json!(false));
    assert_eq!(data[mqx_health::ERROR_KEY], serde_json::json!("consumer loop is not running"));
}

#[tokio::test(flavor = "current_thread")]
async fn test_repeated_pull_failures_still_observe_cancellation() {
    let consumer = FailingConsumer {
        config: config(AckMode::Auto, false),
    };
    let handler = |_ctx: CancellationToken, _message: Message<String>, _error: Option<TransformError>| {
        futures::future::ready(Ok::<(), anyhow::Error>(()))
    };
    let sink: Arc<dyn ErrorSink> = Arc::new(|_message: &str| {});
    let consumer_loop = ConsumerLoop::new(consumer, handler).with_error_sink(sink);
    let stats = consumer_loop.stats();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let exit = consumer_loop.run(cancel).await;
    assert_eq!(exit, LoopExit::Cancelled);
    assert!(stats.snapshot().pull_errors > 0);
}
