//! In-memory message bus.

use correlator_core::message::{Message, MessageId};
use correlator_core::message_bus::{Acknowledgement, Delivery, DeliveryStream, EventBusError, MessageBus};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    published: Mutex<Vec<(String, Message)>>,
    acknowledgements: Mutex<Vec<(MessageId, Acknowledgement)>>,
    dead_letters: Mutex<Vec<Message>>,
    max_redeliveries: usize,
}

/// Bus fanning published messages out to in-process subscribers.
///
/// Every delivery's acknowledgement is recorded. A requeued delivery is
/// delivered again to the same subscriber, up to a redelivery limit; a
/// rejected one lands in the dead letters. Messages published to a topic
/// nobody subscribes to are recorded but not delivered.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    inner: Arc<Inner>,
}

impl InMemoryMessageBus {
    /// Bus redelivering a requeued message up to three times.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_redeliveries(3)
    }

    /// Bus redelivering a requeued message up to `max` times.
    #[must_use]
    pub fn with_max_redeliveries(max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_redeliveries: max,
                ..Inner::default()
            }),
        }
    }

    /// Drop all subscriptions; their streams end once pending
    /// redeliveries settle.
    pub fn close(&self) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
    }

    /// Every published `(topic, message)` pair.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Message)> {
        self.inner.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Recorded acknowledgements, in the order they arrived.
    #[must_use]
    pub fn acknowledgements(&self) -> Vec<(MessageId, Acknowledgement)> {
        self.inner
            .acknowledgements
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Rejected messages.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Message> {
        self.inner.dead_letters.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` acknowledgements were recorded.
    ///
    /// Returns `false` if `within` elapses first.
    pub async fn wait_for_acknowledgements(&self, count: usize, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while self.acknowledgements().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn deliver(inner: Arc<Inner>, sender: mpsc::UnboundedSender<Delivery>, message: Message, attempt: usize) {
        let (tx, rx) = oneshot::channel();
        if sender.send(Delivery::new(message.clone(), tx)).is_err() {
            return;
        }
        tokio::spawn(async move {
            let Ok(acknowledgement) = rx.await else {
                return;
            };
            if let Ok(mut acks) = inner.acknowledgements.lock() {
                acks.push((message.id(), acknowledgement));
            }
            match acknowledgement {
                Acknowledgement::Ack => {}
                Acknowledgement::Requeue if attempt < inner.max_redeliveries => {
                    Self::deliver(Arc::clone(&inner), sender, message, attempt + 1);
                }
                Acknowledgement::Requeue | Acknowledgement::Reject => {
                    if let Ok(mut dead) = inner.dead_letters.lock() {
                        dead.push(message);
                    }
                }
            }
        });
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();
        Box::pin(async move {
            self.inner
                .published
                .lock()
                .map_err(|_| EventBusError::PublishFailed {
                    topic: topic.clone(),
                    reason: "bus state poisoned".to_string(),
                })?
                .push((topic.clone(), message.clone()));

            let senders = self
                .inner
                .subscribers
                .lock()
                .map(|s| s.get(&topic).cloned().unwrap_or_default())
                .unwrap_or_default();
            for sender in senders {
                Self::deliver(Arc::clone(&self.inner), sender, message.clone(), 0);
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut subscribers =
                    self.inner
                        .subscribers
                        .lock()
                        .map_err(|_| EventBusError::SubscriptionFailed {
                            topics: topics.clone(),
                            reason: "bus state poisoned".to_string(),
                        })?;
                for topic in topics {
                    subscribers.entry(topic).or_default().push(tx.clone());
                }
            }
            drop(tx);

            let stream = async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield Ok(delivery);
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
