//! The task that owns a consumer, hands out deliveries and commits them in
//! acknowledgement order.

use crate::{codec, send, send_raw};
use correlator_core::message::Message;
use correlator_core::message_bus::{Acknowledgement, Delivery, EventBusError};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Message as _, OwnedMessage};
use rdkafka::producer::FutureProducer;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Deliveries = mpsc::Sender<Result<Delivery, EventBusError>>;

struct InFlight {
    topic: String,
    partition: i32,
    offset: i64,
    record: Record,
}

enum Record {
    Decoded {
        message: Message,
        ack: oneshot::Receiver<Acknowledgement>,
    },
    /// Settled as soon as it reaches the front.
    Undecodable { raw: OwnedMessage, reason: String },
}

pub(crate) struct ConsumerWorker {
    pub(crate) consumer: StreamConsumer,
    pub(crate) producer: FutureProducer,
    pub(crate) timeout: Duration,
    pub(crate) max_in_flight: usize,
    pub(crate) dead_letter_topic: Option<String>,
}

impl ConsumerWorker {
    pub(crate) async fn run(self, tx: Deliveries) {
        let mut in_flight: VecDeque<InFlight> = VecDeque::new();
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                acknowledgement = async {
                    match in_flight.front_mut().map(|front| &mut front.record) {
                        Some(Record::Decoded { ack, .. }) => ack.await.unwrap_or(Acknowledgement::Requeue),
                        Some(Record::Undecodable { .. }) => Acknowledgement::Reject,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(front) = in_flight.pop_front() else { continue };
                    if !self.settle(&front, acknowledgement).await {
                        break;
                    }
                }
                next = stream.next(), if in_flight.len() < self.max_in_flight => {
                    let Some(next) = next else { break };
                    match next {
                        Ok(record) => {
                            let topic = record.topic().to_string();
                            match codec::decode(record.payload(), record.headers()) {
                                Ok(message) => {
                                    tracing::trace!(
                                        topic = %topic,
                                        partition = record.partition(),
                                        offset = record.offset(),
                                        message_id = %message.id(),
                                        "Received message"
                                    );
                                    let (ack_tx, ack_rx) = oneshot::channel();
                                    in_flight.push_back(InFlight {
                                        topic,
                                        partition: record.partition(),
                                        offset: record.offset(),
                                        record: Record::Decoded {
                                            message: message.clone(),
                                            ack: ack_rx,
                                        },
                                    });
                                    if tx.send(Ok(Delivery::new(message, ack_tx))).await.is_err() {
                                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        topic = %topic,
                                        partition = record.partition(),
                                        offset = record.offset(),
                                        error = %e,
                                        "Undecodable record, dead-lettering"
                                    );
                                    in_flight.push_back(InFlight {
                                        topic,
                                        partition: record.partition(),
                                        offset: record.offset(),
                                        record: Record::Undecodable {
                                            raw: record.detach(),
                                            reason: e.to_string(),
                                        },
                                    });
                                    if tx.send(Err(e)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(pending = in_flight.len(), "Consumer task exiting");
    }

    /// Apply `acknowledgement` to `delivery` and commit it.
    ///
    /// Returns `false` when the record could not be forwarded, leaving its
    /// offset uncommitted so it is redelivered.
    async fn settle(&self, delivery: &InFlight, acknowledgement: Acknowledgement) -> bool {
        let forward_to = match acknowledgement {
            Acknowledgement::Ack => None,
            Acknowledgement::Requeue => Some(delivery.topic.as_str()),
            // Never feed the dead-letter topic back into itself.
            Acknowledgement::Reject => self
                .dead_letter_topic
                .as_deref()
                .filter(|dead_letters| *dead_letters != delivery.topic),
        };

        let forwarded = match (&delivery.record, forward_to) {
            (Record::Decoded { message, .. }, Some(topic)) => {
                send(&self.producer, topic, message, self.timeout).await
            }
            (Record::Undecodable { raw, reason }, Some(topic)) => {
                let kafka_headers = codec::dead_letter_headers(raw.headers(), reason);
                send_raw(&self.producer, topic, raw, kafka_headers, self.timeout).await
            }
            (record, None) => {
                if acknowledgement == Acknowledgement::Reject {
                    tracing::warn!(
                        topic = %delivery.topic,
                        offset = delivery.offset,
                        undecodable = matches!(record, Record::Undecodable { .. }),
                        "Rejected record dropped, no dead-letter topic configured"
                    );
                }
                Ok(())
            }
        };

        if let Err(e) = forwarded {
            tracing::error!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                ?acknowledgement,
                error = %e,
                "Failed to forward record, stopping consumer"
            );
            return false;
        }

        metrics::counter!("correlator_redpanda_acknowledged_total", "outcome" => format!("{acknowledgement:?}"))
            .increment(1);
        self.commit(&delivery.topic, delivery.partition, delivery.offset);
        true
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) {
        let mut offsets = TopicPartitionList::new();
        let committed = offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .and_then(|()| self.consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = committed {
            tracing::warn!(
                topic = %topic,
                partition = partition,
                offset = offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
}
