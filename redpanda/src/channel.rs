//! Output channel publishing to one topic.

use correlator_core::channel::{ChannelError, MessageChannel, SendFuture};
use correlator_core::message::Message;
use correlator_core::message_bus::EventBusError;
use rdkafka::producer::FutureProducer;
use std::time::Duration;

/// [`MessageChannel`] publishing every message to a fixed topic.
///
/// Created with [`RedpandaMessageBus::channel`](crate::RedpandaMessageBus::channel).
#[derive(Clone)]
pub struct TopicChannel {
    name: String,
    topic: String,
    producer: FutureProducer,
    timeout: Duration,
}

impl TopicChannel {
    pub(crate) fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        producer: FutureProducer,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            producer,
            timeout,
        }
    }

    /// Topic this channel publishes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl MessageChannel for TopicChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) -> SendFuture<'_> {
        Box::pin(async move {
            crate::send(&self.producer, &self.topic, &message, self.timeout)
                .await
                .map_err(|e| ChannelError::SendFailed {
                    channel: self.name.clone(),
                    reason: match e {
                        EventBusError::PublishFailed { reason, .. } => reason,
                        other => other.to_string(),
                    },
                })
        })
    }
}
