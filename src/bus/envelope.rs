use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire limit for a serialized envelope. Larger payloads must be passed by
/// reference (e.g. a row id), never inline.
pub const MAX_ENVELOPE_BYTES: usize = 128 * 1024;

/// Metadata wrapper around every message on the fabric.
///
/// `correlation_id` links a request to its response and to any command or
/// event that follows from it. `reply_to` and `deadline` are only set on
/// requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(source: &str, correlation_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_string(),
            correlation_id,
            reply_to: None,
            deadline: None,
            payload,
        }
    }

    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True once the request's absolute deadline has passed. Consumers
    /// abandon work on expired envelopes instead of processing them.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now > d).unwrap_or(false)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = serde_json::to_vec(self).map_err(EnvelopeError::Encode)?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::PayloadTooLarge { size: bytes.len() });
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Decode the payload into a typed value. Failures are schema violations
    /// and go straight to the DLQ, not into the retry loop.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(EnvelopeError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope exceeds {MAX_ENVELOPE_BYTES} bytes: {size}")]
    PayloadTooLarge { size: usize },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn serialize_deserialize_is_identity() {
        let env = Envelope::new("worker.s1", Some(Uuid::new_v4()), json!({"a": 1, "b": "x"}))
            .with_reply_to("response.abc".to_string())
            .with_deadline(Utc::now() + Duration::seconds(5));

        let bytes = env.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let env = Envelope::new("connector", None, json!({}));
        let text = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("reply_to"));
        assert!(!text.contains("deadline"));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let blob = "x".repeat(MAX_ENVELOPE_BYTES);
        let env = Envelope::new("connector", None, json!({ "blob": blob }));
        assert!(matches!(
            env.to_bytes(),
            Err(EnvelopeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn deadline_expiry() {
        let env = Envelope::new("worker.s1", None, json!({}))
            .with_deadline(Utc::now() - Duration::seconds(1));
        assert!(env.is_expired(Utc::now()));

        let env = Envelope::new("worker.s1", None, json!({}));
        assert!(!env.is_expired(Utc::now()));
    }
}
