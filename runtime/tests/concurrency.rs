//! Concurrent arrivals on one correlation key.

#![allow(clippy::expect_used)]

use correlator_core::correlation::CorrelationKey;
use correlator_core::store::MessageGroupStore;
use correlator_runtime::aggregator::CorrelatingAggregator;
use correlator_runtime::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore};
use correlator_testing::RecordingChannel;
use correlator_testing::fixtures::{message_sent, message_waiting, start_message_deployed};
use std::collections::HashSet;
use std::sync::Arc;

fn aggregator(store: Arc<InMemoryMessageGroupStore>, output: &RecordingChannel) -> Arc<CorrelatingAggregator> {
    Arc::new(
        CorrelatingAggregator::builder()
            .store(store)
            .lock_registry(Arc::new(InMemoryLockRegistry::new()))
            .output(Arc::new(output.clone()))
            .build()
            .expect("all required parts are set"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_sent_event_starts_exactly_one_process() {
    let store = Arc::new(InMemoryMessageGroupStore::new());
    let output = RecordingChannel::new("rb");
    let aggregator = aggregator(store.clone(), &output);

    let mut events: Vec<_> = (0..100)
        .map(|i| message_sent("order").business_key(format!("bk-{i}")).build())
        .collect();
    events.insert(37, start_message_deployed("order").build());

    let handles: Vec<_> = events
        .into_iter()
        .map(|event| {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.handle(event).await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("task").expect("handled");
    }

    let business_keys: HashSet<String> = output
        .messages()
        .iter()
        .filter_map(|m| m.payload()["businessKey"].as_str().map(str::to_string))
        .collect();
    assert_eq!(output.len(), 100);
    assert_eq!(business_keys.len(), 100, "no event was released twice");

    let group = store.get_group(&CorrelationKey::new("rb:order")).await.expect("get");
    assert_eq!(group.size(), 1, "only the deployed event remains");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_and_waits_conserve_events() {
    let store = Arc::new(InMemoryMessageGroupStore::new());
    let output = RecordingChannel::new("rb");
    let aggregator = aggregator(store.clone(), &output);

    let events: Vec<_> = (0..20)
        .flat_map(|i| {
            [
                message_sent("order").correlation_key("42").timestamp(i).build(),
                message_waiting("order").correlation_key("42").timestamp(i).build(),
            ]
        })
        .collect();

    let handles: Vec<_> = events
        .into_iter()
        .map(|event| {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.handle(event).await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("task").expect("handled");
    }

    let group = store
        .get_group(&CorrelationKey::new("rb:order:42"))
        .await
        .expect("get");
    let buffered_sent = group
        .messages()
        .iter()
        .filter(|m| m.is_event_type(correlator_core::message::EventType::MessageSent))
        .count();
    assert!(!output.is_empty());
    assert_eq!(output.len() + buffered_sent, 20, "each sent event is either delivered or buffered");
}
