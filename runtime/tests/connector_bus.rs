//! The connector consuming from a message bus.

#![allow(clippy::expect_used)]

use correlator_core::channel::{MessageChannel, SendFuture};
use correlator_core::message::Message;
use correlator_core::message_bus::{Acknowledgement, MessageBus};
use correlator_core::store::MessageGroupStore;
use correlator_runtime::aggregator::CorrelatingAggregator;
use correlator_runtime::connector::MessageConnector;
use correlator_runtime::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore};
use correlator_runtime::retry::RetryPolicy;
use correlator_testing::faulty::FaultyStore;
use correlator_testing::fixtures::{message_sent, start_message_deployed};
use correlator_testing::helpers::init_test_tracing;
use correlator_testing::{InMemoryMessageBus, RecordingChannel};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

const TOPIC: &str = "messageEvents";

fn connector(store: Arc<dyn MessageGroupStore>, output: &RecordingChannel) -> Arc<MessageConnector> {
    connector_to(store, Arc::new(output.clone()))
}

fn connector_to(store: Arc<dyn MessageGroupStore>, output: Arc<dyn MessageChannel>) -> Arc<MessageConnector> {
    let aggregator = CorrelatingAggregator::builder()
        .store(store)
        .lock_registry(Arc::new(InMemoryLockRegistry::new()))
        .output(output)
        .build()
        .expect("all required parts are set");
    Arc::new(
        MessageConnector::new(Arc::new(aggregator))
            .with_retry_policy(
                RetryPolicy::builder()
                    .max_retries(2)
                    .initial_delay(Duration::from_millis(1))
                    .build(),
            )
            .with_concurrency(4),
    )
}

async fn spawn_run(
    connector: &Arc<MessageConnector>,
    bus: &InMemoryMessageBus,
) -> tokio::task::JoinHandle<()> {
    let connector = Arc::clone(connector);
    let bus = bus.clone();
    let handle = tokio::spawn(async move {
        connector.run(&bus, &[TOPIC]).await.expect("subscribed");
    });
    // Let the consumer subscribe before anything is published.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle
}

#[tokio::test]
async fn consumes_correlates_and_acknowledges() {
    init_test_tracing();
    let bus = InMemoryMessageBus::new();
    let output = RecordingChannel::new("rb");
    let connector = connector(Arc::new(InMemoryMessageGroupStore::new()), &output);
    let run = spawn_run(&connector, &bus).await;

    bus.publish(TOPIC, &start_message_deployed("order").build()).await.expect("publish");
    assert!(bus.wait_for_acknowledgements(1, Duration::from_secs(2)).await);
    let sent = message_sent("order").event_id("evt-1").build();
    bus.publish(TOPIC, &sent).await.expect("publish");
    assert!(bus.wait_for_acknowledgements(2, Duration::from_secs(2)).await);
    bus.publish(TOPIC, &sent).await.expect("publish");

    assert!(bus.wait_for_acknowledgements(3, Duration::from_secs(2)).await);
    bus.close();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("consumer stops")
        .expect("task");

    assert!(bus.acknowledgements().iter().all(|(_, ack)| *ack == Acknowledgement::Ack));
    assert_eq!(output.len(), 1, "the redelivered sent event is a duplicate");
}

#[tokio::test]
async fn malformed_event_is_rejected_to_dead_letters() {
    let bus = InMemoryMessageBus::new();
    let output = RecordingChannel::new("rb");
    let connector = connector(Arc::new(InMemoryMessageGroupStore::new()), &output);
    let run = spawn_run(&connector, &bus).await;

    let template = message_sent("order").build();
    let malformed = Message::builder(json!(["not", "an", "object"]))
        .copy_headers(template.headers())
        .build();
    bus.publish(TOPIC, &malformed).await.expect("publish");

    assert!(bus.wait_for_acknowledgements(1, Duration::from_secs(2)).await);
    bus.close();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;

    assert_eq!(bus.acknowledgements(), vec![(malformed.id(), Acknowledgement::Reject)]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bus.dead_letters().len(), 1);
}

#[tokio::test]
async fn storage_outage_requeues_until_recovered() {
    let inner = Arc::new(InMemoryMessageGroupStore::new());
    let faulty = FaultyStore::new(inner.clone());
    faulty.set_unavailable(true);
    let bus = InMemoryMessageBus::with_max_redeliveries(1_000);
    let output = RecordingChannel::new("rb");
    let connector = connector(Arc::new(faulty.clone()), &output);
    let run = spawn_run(&connector, &bus).await;

    bus.publish(TOPIC, &message_sent("order").build()).await.expect("publish");
    assert!(bus.wait_for_acknowledgements(1, Duration::from_secs(2)).await);
    faulty.set_unavailable(false);
    assert!(bus.wait_for_acknowledgements(2, Duration::from_secs(2)).await);
    bus.close();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;

    let acks: Vec<Acknowledgement> = bus.acknowledgements().into_iter().map(|(_, a)| a).collect();
    assert_eq!(acks[0], Acknowledgement::Requeue);
    assert_eq!(acks.last(), Some(&Acknowledgement::Ack));
    assert_eq!(inner.group_count().await, 1);
}

/// Holds every send until the gate is opened.
#[derive(Default)]
struct GatedChannel {
    entered: Notify,
    gate: Notify,
    sent: AtomicUsize,
}

impl MessageChannel for GatedChannel {
    fn name(&self) -> &str {
        "gated"
    }

    fn send(&self, _message: Message) -> SendFuture<'_> {
        Box::pin(async move {
            self.entered.notify_one();
            self.gate.notified().await;
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn shutdown_drains_in_flight_deliveries() {
    let bus = InMemoryMessageBus::new();
    let output = Arc::new(GatedChannel::default());
    let connector = connector_to(Arc::new(InMemoryMessageGroupStore::new()), output.clone());
    let (stop, stopped) = oneshot::channel::<()>();
    let run = {
        let connector = Arc::clone(&connector);
        let bus = bus.clone();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            connector.run_until(&bus, &[TOPIC], shutdown).await.expect("subscribed");
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    bus.publish(TOPIC, &start_message_deployed("order").build()).await.expect("publish");
    assert!(bus.wait_for_acknowledgements(1, Duration::from_secs(2)).await);
    bus.publish(TOPIC, &message_sent("order").build()).await.expect("publish");
    tokio::time::timeout(Duration::from_secs(2), output.entered.notified())
        .await
        .expect("dispatch started");

    stop.send(()).expect("runner is listening");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished(), "the in-flight delivery is still being handled");

    output.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("consumer drains and stops")
        .expect("task");

    assert_eq!(output.sent.load(Ordering::SeqCst), 1);
    assert!(bus.wait_for_acknowledgements(2, Duration::from_secs(2)).await);
    let acks = bus.acknowledgements();
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|(_, ack)| *ack == Acknowledgement::Ack));
}
