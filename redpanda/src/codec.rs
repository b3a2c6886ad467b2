//! Kafka record encoding of [`Message`].
//!
//! The record value is the JSON payload. Every message header becomes a
//! Kafka header whose value is the JSON encoding of the header value; the
//! message id and timestamp travel as the `id` and `timestamp` headers.
//! Header values that are not valid JSON are read as plain strings, so
//! records from producers that write raw string headers still decode.

use correlator_core::headers;
use correlator_core::message::{Message, MessageId};
use correlator_core::message_bus::EventBusError;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use serde_json::Value;

/// Kafka header carrying the message id.
pub const ID_HEADER: &str = "id";

/// Kafka header added to a dead-lettered record that could not be decoded.
pub const DECODE_ERROR_HEADER: &str = "decodeError";

/// Encode `message` as a record value and headers.
///
/// # Errors
///
/// Returns [`EventBusError::SerializationFailed`] if the payload or a header
/// cannot be encoded.
pub fn encode(message: &Message) -> Result<(Vec<u8>, OwnedHeaders), EventBusError> {
    let payload = serde_json::to_vec(message.payload())
        .map_err(|e| EventBusError::SerializationFailed(format!("payload: {e}")))?;

    let mut kafka_headers = OwnedHeaders::new().insert(Header {
        key: ID_HEADER,
        value: Some(message.id().to_string().as_bytes()),
    });
    for (name, value) in message.headers() {
        if name == ID_HEADER {
            continue;
        }
        let encoded = serde_json::to_vec(value)
            .map_err(|e| EventBusError::SerializationFailed(format!("header '{name}': {e}")))?;
        kafka_headers = kafka_headers.insert(Header {
            key: name.as_str(),
            value: Some(&encoded),
        });
    }
    Ok((payload, kafka_headers))
}

/// Decode a record into a [`Message`].
///
/// # Errors
///
/// Returns [`EventBusError::DeserializationFailed`] if the record has no
/// value or the value is not JSON.
pub fn decode<H: Headers + ?Sized>(payload: Option<&[u8]>, kafka_headers: Option<&H>) -> Result<Message, EventBusError> {
    let payload = payload.ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    let payload: Value = serde_json::from_slice(payload)
        .map_err(|e| EventBusError::DeserializationFailed(format!("payload is not JSON: {e}")))?;

    let mut builder = Message::builder(payload);
    if let Some(kafka_headers) = kafka_headers {
        for header in (0..kafka_headers.count()).filter_map(|i| kafka_headers.try_get(i)) {
            let Some(raw) = header.value else {
                continue;
            };
            let value = serde_json::from_slice::<Value>(raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()));

            if header.key == ID_HEADER {
                if let Some(id) = value.as_str().and_then(|s| s.parse::<MessageId>().ok()) {
                    builder = builder.id(id);
                }
                continue;
            }
            builder = builder.header(header.key, value);
        }
    }
    Ok(builder.build())
}

/// Headers for dead-lettering an undecodable record: the original headers
/// followed by [`DECODE_ERROR_HEADER`] carrying `reason`.
#[must_use]
pub fn dead_letter_headers<H: Headers + ?Sized>(original: Option<&H>, reason: &str) -> OwnedHeaders {
    let mut kafka_headers = OwnedHeaders::new();
    if let Some(original) = original {
        for header in (0..original.count()).filter_map(|i| original.try_get(i)) {
            kafka_headers = kafka_headers.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
    }
    kafka_headers.insert(Header {
        key: DECODE_ERROR_HEADER,
        value: Some(reason.as_bytes()),
    })
}

/// Partition key keeping events of one message definition in order.
#[must_use]
pub fn partition_key(message: &Message) -> String {
    match (
        message.header_str(headers::APP_NAME),
        message.header_str(headers::MESSAGE_EVENT_NAME),
    ) {
        (Some(app), Some(name)) => format!("{app}:{name}"),
        (None, Some(name)) => name.to_string(),
        _ => message.id().to_string(),
    }
}
