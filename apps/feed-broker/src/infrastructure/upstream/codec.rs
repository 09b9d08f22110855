//! Wire Codec
//!
//! JSON encoding and decoding for both channels the broker speaks.
//!
//! - **Upstream**: text frames tagged by `type`: `snapshot`, `delta-batch`
//!   or `control`. Control messages are forwarded as-is minus the tag.
//! - **Subscribers**: `BrokerEvent` out, `SubscriberMessage` in.
//!
//! Source timestamps are epoch milliseconds, integer or fractional.
//! Fractions are floored to whole milliseconds.
//!
//! Anything that fails to decode is a malformed message; the caller logs and
//! drops it.

use crate::domain::streaming::{
    BrokerEvent, DeltaBatch, Snapshot, SubscriberMessage, UpstreamMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for upstream frames and subscriber messages.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an upstream text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object, has no string
    /// `type`, names an unknown type, or does not match that type's shape.
    pub fn decode(&self, text: &str) -> Result<UpstreamMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        let serde_json::Value::Object(mut object) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                preview(text)
            )));
        };

        let msg_type = match object.get("type") {
            Some(serde_json::Value::String(t)) => t.clone(),
            Some(_) => {
                return Err(CodecError::InvalidFormat(
                    "`type` is not a string".to_string(),
                ));
            }
            None => return Err(CodecError::InvalidFormat("missing `type`".to_string())),
        };

        match msg_type.as_str() {
            "snapshot" => {
                let snapshot: Snapshot = serde_json::from_value(object.into())?;
                Ok(UpstreamMessage::Snapshot(snapshot))
            }
            "delta-batch" => {
                let batch: DeltaBatch = serde_json::from_value(object.into())?;
                Ok(UpstreamMessage::DeltaBatch(batch))
            }
            "control" => {
                object.remove("type");
                Ok(UpstreamMessage::Control(object))
            }
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }

    /// Encode a broker event for a subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_event(&self, event: &BrokerEvent) -> Result<String, CodecError> {
        Ok(serde_json::to_string(event)?)
    }

    /// Decode a message received from a subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known subscriber message.
    pub fn decode_subscriber(&self, text: &str) -> Result<SubscriberMessage, CodecError> {
        Ok(serde_json::from_str(text.trim())?)
    }
}

fn preview(text: &str) -> &str {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .nth(50)
        .map_or(trimmed.len(), |(index, _)| index);
    &trimmed[..end]
}

// =============================================================================
// Tests
// =============================================================================
