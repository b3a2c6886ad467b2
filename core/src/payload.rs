//! Command payloads derived from lifecycle events.
//!
//! Released `MESSAGE_SENT` events are converted into one of two commands:
//!
//! - [`StartMessagePayload`] - starts a process instance through a message
//!   start event
//! - [`ReceiveMessagePayload`] - delivers the message to a waiting catch event
//!
//! Conversion walks the JSON payload explicitly so every malformed field is
//! reported with the offending message id.

use crate::headers;
use crate::message::{Message, MessageId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while converting an event payload.
///
/// Conversion faults are never retryable: redelivering the same bytes
/// produces the same fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The payload is not a JSON object
    #[error("Payload of message {message_id} is not a JSON object")]
    NotAnObject {
        /// The offending message
        message_id: MessageId,
    },

    /// A required field is absent or null
    #[error("Payload of message {message_id} is missing required field '{field}'")]
    MissingField {
        /// The offending message
        message_id: MessageId,
        /// Field name
        field: &'static str,
    },

    /// A field has the wrong JSON type
    #[error("Payload field '{field}' of message {message_id} must be {expected}")]
    InvalidField {
        /// The offending message
        message_id: MessageId,
        /// Field name
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
    },

    /// The command could not be encoded as JSON
    #[error("Failed to encode command payload: {0}")]
    Encoding(String),
}

impl ConversionError {
    /// The message whose payload failed to convert, when known.
    #[must_use]
    pub const fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::NotAnObject { message_id }
            | Self::MissingField { message_id, .. }
            | Self::InvalidField { message_id, .. } => Some(*message_id),
            Self::Encoding(_) => None,
        }
    }
}

/// Typed view over an event's payload object.
struct Fields<'a> {
    message_id: MessageId,
    object: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn of(message: &'a Message) -> Result<Self, ConversionError> {
        let object = message
            .payload()
            .as_object()
            .ok_or(ConversionError::NotAnObject {
                message_id: message.id(),
            })?;
        Ok(Self {
            message_id: message.id(),
            object,
        })
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, ConversionError> {
        match self.object.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ConversionError::InvalidField {
                message_id: self.message_id,
                field,
                expected: "a string",
            }),
        }
    }

    fn required_str(&self, field: &'static str) -> Result<String, ConversionError> {
        self.optional_str(field)?
            .ok_or(ConversionError::MissingField {
                message_id: self.message_id,
                field,
            })
    }

    fn variables(&self) -> Result<Map<String, Value>, ConversionError> {
        match self.object.get("variables") {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(ConversionError::InvalidField {
                message_id: self.message_id,
                field: "variables",
                expected: "an object",
            }),
        }
    }
}

/// Generic shape every lifecycle event payload must have.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEventPayload {
    /// Message name
    pub name: String,
    /// Business key of the emitting process instance
    pub business_key: Option<String>,
    /// Correlation key of the message
    pub correlation_key: Option<String>,
    /// Message variables
    pub variables: Map<String, Value>,
}

impl TryFrom<&Message> for MessageEventPayload {
    type Error = ConversionError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let fields = Fields::of(message)?;
        Ok(Self {
            name: fields.required_str("name")?,
            business_key: fields.optional_str("businessKey")?,
            correlation_key: fields.optional_str("correlationKey")?,
            variables: fields.variables()?,
        })
    }
}

/// Command that starts a process instance through a message start event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessagePayload {
    /// Fresh command id
    pub id: String,
    /// Message name
    pub name: String,
    /// Business key forwarded to the started instance
    pub business_key: Option<String>,
    /// Variables forwarded to the started instance
    pub variables: Map<String, Value>,
}

impl StartMessagePayload {
    /// Value of the `messagePayloadType` header.
    pub const PAYLOAD_TYPE: &'static str = "StartMessagePayload";
}

impl TryFrom<&Message> for StartMessagePayload {
    type Error = ConversionError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let fields = Fields::of(message)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: fields.required_str("name")?,
            business_key: fields.optional_str("businessKey")?,
            variables: fields.variables()?,
        })
    }
}

/// Command that delivers a message to a waiting catch event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMessagePayload {
    /// Fresh command id
    pub id: String,
    /// Message name
    pub name: String,
    /// Correlation key of the waiting subscription
    pub correlation_key: String,
    /// Variables delivered to the waiting instance
    pub variables: Map<String, Value>,
}

impl ReceiveMessagePayload {
    /// Value of the `messagePayloadType` header.
    pub const PAYLOAD_TYPE: &'static str = "ReceiveMessagePayload";
}

impl TryFrom<&Message> for ReceiveMessagePayload {
    type Error = ConversionError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let fields = Fields::of(message)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: fields.required_str("name")?,
            correlation_key: fields.required_str("correlationKey")?,
            variables: fields.variables()?,
        })
    }
}

/// A released command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandPayload {
    /// Start a process instance
    Start(StartMessagePayload),
    /// Deliver to a waiting catch event
    Receive(ReceiveMessagePayload),
}

impl CommandPayload {
    /// Value of the `messagePayloadType` header.
    #[must_use]
    pub const fn payload_type(&self) -> &'static str {
        match self {
            Self::Start(_) => StartMessagePayload::PAYLOAD_TYPE,
            Self::Receive(_) => ReceiveMessagePayload::PAYLOAD_TYPE,
        }
    }

    /// Build the outbound message for this command.
    ///
    /// Headers are copied from `source` so routing information travels with
    /// the command; the payload type header is added and the message gets a
    /// new id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Encoding`] if the payload cannot be encoded.
    pub fn to_message(&self, source: &Message) -> Result<Message, ConversionError> {
        let payload = match self {
            Self::Start(p) => serde_json::to_value(p),
            Self::Receive(p) => serde_json::to_value(p),
        }
        .map_err(|e| ConversionError::Encoding(e.to_string()))?;

        Ok(Message::builder(payload)
            .copy_headers(source.headers())
            .header(headers::MESSAGE_PAYLOAD_TYPE, self.payload_type())
            .timestamp(Utc::now().timestamp_millis())
            .build())
    }
}

impl From<StartMessagePayload> for CommandPayload {
    fn from(payload: StartMessagePayload) -> Self {
        Self::Start(payload)
    }
}

impl From<ReceiveMessagePayload> for CommandPayload {
    fn from(payload: ReceiveMessagePayload) -> Self {
        Self::Receive(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventType;
    use serde_json::json;

    fn sent(payload: Value) -> Message {
        Message::builder(payload)
            .event_type(EventType::MessageSent)
            .header(headers::MESSAGE_EVENT_OUTPUT_DESTINATION, "rb")
            .build()
    }

    mod start_tests {
        use super::*;

        #[test]
        fn converts_name_business_key_and_variables() {
            let message = sent(json!({
                "name": "orderPlaced",
                "businessKey": "bk-1",
                "variables": { "amount": 10 }
            }));

            let payload = StartMessagePayload::try_from(&message);

            let payload = payload.as_ref().ok();
            assert_eq!(payload.map(|p| p.name.as_str()), Some("orderPlaced"));
            assert_eq!(payload.and_then(|p| p.business_key.as_deref()), Some("bk-1"));
            assert_eq!(payload.map(|p| &p.variables["amount"]), Some(&json!(10)));
        }

        #[test]
        fn null_business_key_and_variables_are_allowed() {
            let message = sent(json!({ "name": "orderPlaced", "businessKey": null, "variables": null }));
            let payload = StartMessagePayload::try_from(&message);
            assert!(matches!(
                payload,
                Ok(StartMessagePayload { business_key: None, ref variables, .. }) if variables.is_empty()
            ));
        }

        #[test]
        fn non_object_payload_fails() {
            let message = sent(json!("just a string"));
            assert_eq!(
                StartMessagePayload::try_from(&message),
                Err(ConversionError::NotAnObject {
                    message_id: message.id()
                })
            );
        }

        #[test]
        fn wrongly_typed_variables_fail() {
            let message = sent(json!({ "name": "x", "variables": [1, 2] }));
            assert!(matches!(
                StartMessagePayload::try_from(&message),
                Err(ConversionError::InvalidField { field: "variables", .. })
            ));
        }

        #[test]
        fn each_conversion_gets_fresh_id() {
            let message = sent(json!({ "name": "x" }));
            let a = StartMessagePayload::try_from(&message).map(|p| p.id);
            let b = StartMessagePayload::try_from(&message).map(|p| p.id);
            assert_ne!(a, b);
        }
    }

    mod receive_tests {
        use super::*;

        #[test]
        fn requires_correlation_key() {
            let message = sent(json!({ "name": "x", "correlationKey": null }));
            assert_eq!(
                ReceiveMessagePayload::try_from(&message).map(|p| p.name),
                Err(ConversionError::MissingField {
                    message_id: message.id(),
                    field: "correlationKey"
                })
            );
        }

        #[test]
        fn converts_correlation_key() {
            let message = sent(json!({ "name": "x", "correlationKey": "ck" }));
            assert_eq!(
                ReceiveMessagePayload::try_from(&message).map(|p| p.correlation_key),
                Ok("ck".to_string())
            );
        }
    }

    mod command_tests {
        use super::*;

        #[test]
        fn to_message_tags_payload_type_and_keeps_destination() {
            let source = sent(json!({ "name": "x", "correlationKey": "ck" }));
            let command = ReceiveMessagePayload::try_from(&source).map(CommandPayload::from);

            let message = command.and_then(|c| c.to_message(&source));

            let message = message.as_ref().ok();
            assert_eq!(
                message.and_then(|m| m.header_str(headers::MESSAGE_PAYLOAD_TYPE)),
                Some("ReceiveMessagePayload")
            );
            assert_eq!(message.and_then(Message::output_destination), Some("rb"));
            assert_eq!(
                message.map(|m| &m.payload()["correlationKey"]),
                Some(&json!("ck"))
            );
            assert_ne!(message.map(Message::id), Some(source.id()));
        }

        #[test]
        fn event_payload_rejects_missing_name() {
            let message = sent(json!({ "businessKey": "bk" }));
            assert!(matches!(
                MessageEventPayload::try_from(&message),
                Err(ConversionError::MissingField { field: "name", .. })
            ));
        }
    }
}
