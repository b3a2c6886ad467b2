//! Output channels for tests.

use correlator_core::channel::{ChannelError, MessageChannel, SendFuture};
use correlator_core::message::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every message sent to it.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    name: String,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl RecordingChannel {
    /// Recording channel called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: Arc::default(),
        }
    }

    /// Messages received so far, in send order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Number of messages received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or_default()
    }

    /// Whether nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload `id` fields of the received commands, in send order.
    #[must_use]
    pub fn payload_ids(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.payload().get("id").and_then(|id| id.as_str()).map(str::to_string))
            .collect()
    }
}

impl MessageChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) -> SendFuture<'_> {
        Box::pin(async move {
            self.sent
                .lock()
                .map_err(|_| ChannelError::Closed(self.name.clone()))?
                .push(message);
            Ok(())
        })
    }
}

/// Accepts a fixed number of sends, then fails every later one.
#[derive(Clone)]
pub struct FailingChannel {
    inner: RecordingChannel,
    accept: usize,
    attempts: Arc<AtomicUsize>,
}

impl FailingChannel {
    /// Channel whose every send fails.
    #[must_use]
    pub fn always(name: impl Into<String>) -> Self {
        Self::after(name, 0)
    }

    /// Channel accepting the first `accept` sends.
    #[must_use]
    pub fn after(name: impl Into<String>, accept: usize) -> Self {
        Self {
            inner: RecordingChannel::new(name),
            accept,
            attempts: Arc::default(),
        }
    }

    /// Messages that were accepted.
    #[must_use]
    pub fn accepted(&self) -> Vec<Message> {
        self.inner.messages()
    }

    /// Number of send attempts, accepted or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessageChannel for FailingChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn send(&self, message: Message) -> SendFuture<'_> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.accept {
            return self.inner.send(message);
        }
        Box::pin(async move {
            Err(ChannelError::SendFailed {
                channel: self.inner.name().to_string(),
                reason: format!("send {} refused", attempt + 1),
            })
        })
    }
}
