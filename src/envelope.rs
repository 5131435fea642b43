//! Wire envelope codec
//!
//! Every message on the broker channel is a single string:
//! `<message-id>;<json-object>`, e.g. `ping;{"n":1}`.
//!
//! The id ends at the first `;`. Nothing is escaped, so an id containing the
//! delimiter would be split in the wrong place; such ids are rejected on the
//! way out instead.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Separator between the message id and the JSON body
pub const DELIMITER: char = ';';

/// Decoded message payload. Always a JSON object on the receive path.
pub type Payload = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: no ';' delimiter")]
    MalformedEnvelope,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("message id '{0}' contains the ';' delimiter")]
    DelimiterInId(String),

    #[error("message data must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("failed to serialize message data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An outgoing message: an identifier plus structured data
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    id: String,
    data: T,
}

impl<T: Serialize> Message<T> {
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Encode this message into its wire form
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        encode(&self.id, &self.data)
    }
}

/// A decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub payload: Payload,
}

/// Check that a message id can survive the trip through the wire format
pub fn validate_id(id: &str) -> Result<(), EnvelopeError> {
    if id.contains(DELIMITER) {
        return Err(EnvelopeError::DelimiterInId(id.to_string()));
    }
    Ok(())
}

/// Encode `data` under `id` into a wire string
pub fn encode<T: Serialize + ?Sized>(id: &str, data: &T) -> Result<String, EnvelopeError> {
    validate_id(id)?;

    let value = serde_json::to_value(data)?;
    if !value.is_object() {
        return Err(EnvelopeError::NotAnObject(json_kind(&value)));
    }

    let body = serde_json::to_string(&value)?;

    let mut wire = String::with_capacity(id.len() + 1 + body.len());
    wire.push_str(id);
    wire.push(DELIMITER);
    wire.push_str(&body);
    Ok(wire)
}

/// Split a wire string into `(id, body)` at the first delimiter
pub fn split(wire: &str) -> Result<(&str, &str), EnvelopeError> {
    wire.split_once(DELIMITER)
        .ok_or(EnvelopeError::MalformedEnvelope)
}

/// Parse an envelope body as a JSON object
pub fn parse_payload(body: &str) -> Result<Payload, EnvelopeError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(EnvelopeError::MalformedPayload(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(EnvelopeError::MalformedPayload(e.to_string())),
    }
}

/// Decode a full wire string
pub fn decode(wire: &str) -> Result<Envelope, EnvelopeError> {
    let (id, body) = split(wire)?;
    let payload = parse_payload(body)?;

    Ok(Envelope {
        id: id.to_string(),
        payload,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
