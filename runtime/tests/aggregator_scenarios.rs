//! End-to-end correlation scenarios against the in-memory backend.

#![allow(clippy::expect_used)]

use correlator_core::channel::{ChannelError, MessageChannel};
use correlator_core::correlation::CorrelationKey;
use correlator_core::headers;
use correlator_core::payload::{ReceiveMessagePayload, StartMessagePayload};
use correlator_core::store::MessageGroupStore;
use correlator_runtime::aggregator::{AggregatorError, CorrelatingAggregator, HandleOutcome};
use correlator_runtime::config::AggregatorConfig;
use correlator_runtime::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore};
use correlator_runtime::router::{DestinationRouter, StaticChannelResolver};
use correlator_testing::faulty::{FaultyStore, StoreOperation};
use correlator_testing::fixtures::{
    message_received, message_sent, message_waiting, start_message_deployed, subscription_cancelled,
};
use correlator_testing::{FailingChannel, RecordingChannel};
use std::sync::Arc;

struct Harness {
    aggregator: CorrelatingAggregator,
    store: Arc<InMemoryMessageGroupStore>,
    output: RecordingChannel,
}

fn harness_with(config: AggregatorConfig) -> Harness {
    let store = Arc::new(InMemoryMessageGroupStore::new());
    let output = RecordingChannel::new("rb");
    let channel: Arc<dyn MessageChannel> = Arc::new(output.clone());
    let router = DestinationRouter::new(Arc::new(StaticChannelResolver::new().channel("rb", channel)));
    let aggregator = CorrelatingAggregator::builder()
        .store(store.clone())
        .lock_registry(Arc::new(InMemoryLockRegistry::new()))
        .output(Arc::new(router))
        .config(config)
        .build()
        .expect("all required parts are set");
    Harness {
        aggregator,
        store,
        output,
    }
}

fn harness() -> Harness {
    harness_with(AggregatorConfig::default())
}

impl Harness {
    async fn handle(&self, message: correlator_core::message::Message) -> HandleOutcome {
        self.aggregator.handle(message).await.expect("handled")
    }

    async fn size(&self, key: &str) -> usize {
        self.store
            .group_size(&CorrelationKey::new(key))
            .await
            .expect("size")
    }
}

mod start_messages {
    use super::*;

    #[tokio::test]
    async fn deployed_then_sent_starts_process() {
        let h = harness();
        h.handle(start_message_deployed("order").build()).await;

        let outcome = h
            .handle(message_sent("order").business_key("bk").variable("amount", 10).build())
            .await;

        assert!(matches!(outcome, HandleOutcome::Released { dispatched: 1, .. }));
        let commands = h.output.messages();
        assert_eq!(commands.len(), 1);
        let command = &commands[0];
        assert_eq!(
            command.header_str(headers::MESSAGE_PAYLOAD_TYPE),
            Some(StartMessagePayload::PAYLOAD_TYPE)
        );
        assert_eq!(command.payload()["name"], "order");
        assert_eq!(command.payload()["businessKey"], "bk");
        assert_eq!(command.payload()["variables"]["amount"], 10);
        assert_eq!(h.size("rb:order").await, 1, "deployed event stays buffered");
    }

    #[tokio::test]
    async fn sent_before_deployment_is_released_on_deployment() {
        let h = harness();
        let first = h.handle(message_sent("order").timestamp(2).build()).await;
        let second = h.handle(message_sent("order").timestamp(1).build()).await;
        assert!(matches!(first, HandleOutcome::Accumulated { size: 1, .. }));
        assert!(matches!(second, HandleOutcome::Accumulated { size: 2, .. }));

        let outcome = h.handle(start_message_deployed("order").build()).await;

        assert!(matches!(outcome, HandleOutcome::Released { dispatched: 2, .. }));
        assert_eq!(h.output.len(), 2);
        assert_eq!(h.size("rb:order").await, 1);
    }

    #[tokio::test]
    async fn released_commands_follow_source_timestamps() {
        let h = harness();
        let late = message_sent("order").business_key("late").timestamp(20).build();
        let early = message_sent("order").business_key("early").timestamp(10).build();
        h.handle(late).await;
        h.handle(early).await;

        h.handle(start_message_deployed("order").build()).await;

        let keys: Vec<String> = h
            .output
            .messages()
            .iter()
            .filter_map(|m| m.payload()["businessKey"].as_str().map(str::to_string))
            .collect();
        assert_eq!(keys, vec!["early", "late"]);
    }
}

mod receive_messages {
    use super::*;

    #[tokio::test]
    async fn waiting_then_sent_delivers_to_catch_event() {
        let h = harness();
        h.handle(message_waiting("order").correlation_key("42").build()).await;

        let outcome = h
            .handle(message_sent("order").correlation_key("42").variable("x", 1).build())
            .await;

        assert!(matches!(outcome, HandleOutcome::Released { dispatched: 1, .. }));
        let command = &h.output.messages()[0];
        assert_eq!(
            command.header_str(headers::MESSAGE_PAYLOAD_TYPE),
            Some(ReceiveMessagePayload::PAYLOAD_TYPE)
        );
        assert_eq!(command.payload()["correlationKey"], "42");
        assert_eq!(command.payload()["variables"]["x"], 1);
        assert_eq!(h.size("rb:order:42").await, 1, "waiting event stays until received");
    }

    #[tokio::test]
    async fn sent_then_waiting_delivers_oldest_only() {
        let h = harness();
        h.handle(message_sent("order").correlation_key("42").business_key("b").timestamp(2).build())
            .await;
        h.handle(message_sent("order").correlation_key("42").business_key("a").timestamp(1).build())
            .await;

        let outcome = h.handle(message_waiting("order").correlation_key("42").build()).await;

        assert!(matches!(outcome, HandleOutcome::Released { dispatched: 1, .. }));
        assert_eq!(h.output.len(), 1);
        assert_eq!(h.size("rb:order:42").await, 2, "one sent and the waiting event remain");
    }

    #[tokio::test]
    async fn received_removes_waiting_and_expires_group() {
        let h = harness();
        h.handle(message_waiting("order").correlation_key("42").build()).await;
        h.handle(message_sent("order").correlation_key("42").build()).await;

        let outcome = h.handle(message_received("order").correlation_key("42").build()).await;

        assert!(matches!(outcome, HandleOutcome::Advised { removed: 1, .. }));
        assert_eq!(h.size("rb:order:42").await, 0);
        let group = h
            .store
            .get_group(&CorrelationKey::new("rb:order:42"))
            .await
            .expect("get");
        assert!(!group.is_complete(), "expired groups read as fresh");
        assert_eq!(h.store.group_count().await, 0);
    }

    #[tokio::test]
    async fn cancelled_subscription_removes_every_waiting_event() {
        let h = harness();
        h.handle(message_waiting("order").correlation_key("42").build()).await;
        h.handle(message_waiting("order").correlation_key("42").build()).await;

        let outcome = h
            .handle(subscription_cancelled("order").correlation_key("42").build())
            .await;

        assert!(matches!(outcome, HandleOutcome::Advised { removed: 2, .. }));
        assert_eq!(h.size("rb:order:42").await, 0);
    }

    #[tokio::test]
    async fn advice_on_unknown_group_changes_nothing() {
        let h = harness();

        let outcome = h.handle(message_received("order").correlation_key("42").build()).await;

        assert!(matches!(outcome, HandleOutcome::Advised { removed: 0, .. }));
        assert_eq!(h.store.group_count().await, 0);
    }
}

mod completion {
    use super::*;

    #[tokio::test]
    async fn completed_group_discards_late_events() {
        let h = harness_with(AggregatorConfig::default().with_expire_groups_upon_completion(false));
        h.handle(message_waiting("order").correlation_key("42").build()).await;
        h.handle(message_received("order").correlation_key("42").build()).await;

        let outcome = h.handle(message_sent("order").correlation_key("42").build()).await;

        assert!(matches!(outcome, HandleOutcome::Discarded { .. }));
        assert!(h.output.is_empty());
    }

    #[tokio::test]
    async fn groups_stay_open_when_completion_is_disabled() {
        let h = harness_with(AggregatorConfig::default().with_complete_groups_when_empty(false));
        h.handle(message_waiting("order").correlation_key("42").build()).await;
        h.handle(message_received("order").correlation_key("42").build()).await;

        let outcome = h.handle(message_waiting("order").correlation_key("42").build()).await;

        assert!(matches!(outcome, HandleOutcome::Accumulated { size: 1, .. }));
    }
}

mod duplicates {
    use super::*;

    #[tokio::test]
    async fn redelivered_sent_event_is_dispatched_once() {
        let h = harness();
        h.handle(start_message_deployed("order").build()).await;

        let first = h.handle(message_sent("order").event_id("evt-1").build()).await;
        let again = h.handle(message_sent("order").event_id("evt-1").build()).await;

        assert!(matches!(first, HandleOutcome::Released { dispatched: 1, .. }));
        assert_eq!(again, HandleOutcome::Duplicate);
        assert_eq!(h.output.len(), 1);
        assert_eq!(h.size("rb:order").await, 1);
    }

    #[tokio::test]
    async fn concurrent_redeliveries_are_dispatched_once() {
        let h = harness();
        h.handle(start_message_deployed("order").build()).await;

        let (a, b) = tokio::join!(
            h.aggregator.handle(message_sent("order").event_id("evt-1").build()),
            h.aggregator.handle(message_sent("order").event_id("evt-1").build()),
        );

        let outcomes = [a.expect("first"), b.expect("second")];
        assert_eq!(
            outcomes.iter().filter(|o| **o == HandleOutcome::Duplicate).count(),
            1
        );
        assert_eq!(h.output.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_waiting_event_is_buffered_once() {
        let h = harness();

        h.handle(message_waiting("payment").event_id("w-1").build()).await;
        let again = h.handle(message_waiting("payment").event_id("w-1").build()).await;

        assert_eq!(again, HandleOutcome::Duplicate);
        assert_eq!(h.size("rb:payment").await, 1);
    }
}

mod faults {
    use super::*;

    fn aggregator(store: Arc<dyn MessageGroupStore>, output: Arc<dyn MessageChannel>) -> CorrelatingAggregator {
        CorrelatingAggregator::builder()
            .store(store)
            .lock_registry(Arc::new(InMemoryLockRegistry::new()))
            .output(output)
            .build()
            .expect("all required parts are set")
    }

    #[tokio::test]
    async fn unroutable_command_is_permanent_and_restores_group() {
        let store = Arc::new(InMemoryMessageGroupStore::new());
        let router = DestinationRouter::new(Arc::new(StaticChannelResolver::new()));
        let aggregator = aggregator(store.clone(), Arc::new(router));
        aggregator
            .handle(start_message_deployed("order").build())
            .await
            .expect("buffered");

        let result = aggregator.handle(message_sent("order").build()).await;

        let error = result.expect_err("no destination is registered");
        assert!(matches!(error, AggregatorError::Dispatch(ChannelError::Routing(_))));
        assert!(!error.is_retryable());
        assert_eq!(
            store.group_size(&CorrelationKey::new("rb:order")).await.expect("size"),
            1,
            "the inbound sent event is withdrawn"
        );
    }

    #[tokio::test]
    async fn failed_dispatch_restores_buffered_events() {
        let store = Arc::new(InMemoryMessageGroupStore::new());
        let output = FailingChannel::after("rb", 1);
        let aggregator = aggregator(store.clone(), Arc::new(output.clone()));
        aggregator.handle(message_sent("order").timestamp(1).build()).await.expect("buffered");
        aggregator.handle(message_sent("order").timestamp(2).build()).await.expect("buffered");

        let result = aggregator.handle(start_message_deployed("order").build()).await;

        assert!(matches!(result, Err(AggregatorError::Dispatch(ChannelError::SendFailed { .. }))));
        assert_eq!(output.accepted().len(), 1);
        // The inbound deployed event is withdrawn; the undelivered sent event is back.
        let group = store.get_group(&CorrelationKey::new("rb:order")).await.expect("get");
        assert_eq!(group.size(), 1);
        assert_eq!(group.messages()[0].timestamp(), 2);
    }

    #[tokio::test]
    async fn storage_outage_is_retryable_and_leaves_no_trace() {
        let inner = Arc::new(InMemoryMessageGroupStore::new());
        let faulty = FaultyStore::new(inner.clone());
        faulty.fail_next(StoreOperation::Add, 1);
        let aggregator = aggregator(Arc::new(faulty), Arc::new(RecordingChannel::new("rb")));

        let result = aggregator.handle(message_sent("order").build()).await;

        let error = result.expect_err("add fails once");
        assert!(matches!(error, AggregatorError::Store(_)));
        assert!(error.is_retryable());
        assert_eq!(inner.group_count().await, 0);
    }

    #[tokio::test]
    async fn retryable_failure_lets_redelivery_through() {
        let inner = Arc::new(InMemoryMessageGroupStore::new());
        let faulty = FaultyStore::new(inner.clone());
        faulty.fail_next(StoreOperation::Add, 1);
        let aggregator = aggregator(Arc::new(faulty), Arc::new(RecordingChannel::new("rb")));

        let failed = aggregator.handle(message_sent("order").event_id("evt-1").build()).await;
        let redelivered = aggregator.handle(message_sent("order").event_id("evt-1").build()).await;

        assert!(failed.is_err_and(|e| e.is_retryable()));
        assert!(matches!(redelivered, Ok(HandleOutcome::Accumulated { size: 1, .. })));
    }

    #[tokio::test]
    async fn permanent_failure_keeps_the_event_claimed() {
        let h = harness();
        let template = message_sent("order").event_id("evt-1").build();
        let malformed = || {
            correlator_core::message::Message::builder(serde_json::json!(["not", "an", "object"]))
                .copy_headers(template.headers())
                .build()
        };

        let failed = h.aggregator.handle(malformed()).await;
        let again = h.aggregator.handle(malformed()).await;

        assert!(matches!(failed, Err(AggregatorError::Conversion(_))));
        assert!(matches!(again, Ok(HandleOutcome::Duplicate)));
    }

    #[tokio::test]
    async fn drain_fault_after_commit_restores_selected_events() {
        let inner = Arc::new(InMemoryMessageGroupStore::new());
        let faulty = FaultyStore::new(inner.clone());
        let output = RecordingChannel::new("rb");
        let aggregator = aggregator(Arc::new(faulty.clone()), Arc::new(output.clone()));
        aggregator
            .handle(message_sent("order").timestamp(1).build())
            .await
            .expect("buffered");
        let deployed = start_message_deployed("order").event_id("deployed-1").timestamp(2).build();
        faulty.fail_next_after_commit(StoreOperation::Remove, 1);

        let failed = aggregator.handle(deployed.clone()).await;

        let error = failed.expect_err("the drain reply is lost");
        assert!(matches!(error, AggregatorError::Store(_)));
        assert!(error.is_retryable());
        assert!(output.is_empty());
        let key = CorrelationKey::new("rb:order");
        assert_eq!(inner.group_size(&key).await.expect("size"), 2, "the sent event is back");

        let redelivered = aggregator.handle(deployed).await.expect("redelivery");

        assert!(matches!(redelivered, HandleOutcome::Released { dispatched: 1, .. }));
        assert_eq!(output.len(), 1);
        assert_eq!(inner.group_size(&key).await.expect("size"), 1);
    }

    #[tokio::test]
    async fn stopped_aggregator_refuses_work() {
        let h = harness();
        h.aggregator.stop();

        let result = h.aggregator.handle(message_sent("order").build()).await;

        assert!(matches!(result, Err(AggregatorError::Stopped)));
        assert_eq!(h.store.group_count().await, 0);

        h.aggregator.start();
        assert!(h.aggregator.handle(message_sent("order").build()).await.is_ok());
    }

    #[tokio::test]
    async fn event_without_name_has_no_correlation() {
        let h = harness();
        let event = message_sent("order")
            .header(headers::MESSAGE_EVENT_NAME, serde_json::Value::Null)
            .build();

        let result = h.aggregator.handle(event).await;

        assert!(matches!(result, Err(AggregatorError::MissingCorrelation { .. })));
    }
}
