//! Message envelope carried on the wire.
//!
//! Every message published to the exchange is a UTF-8 JSON object:
//!
//! ```json
//! {
//!   "type": "booking.completed",
//!   "data": { "bookingId": "abc123" },
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "service": "booking-service"
//! }
//! ```
//!
//! Older services name the event `eventName` instead of `type`; both are
//! accepted on input and `type` is always written on output. `timestamp` and
//! `service` are optional on input because not every producer sets them.
//!
//! # Example
//!
//! ```
//! use hometrip_events_core::envelope::Envelope;
//! use serde_json::json;
//!
//! let envelope = Envelope::new("booking.completed", json!({ "bookingId": "abc123" }))
//!     .with_service("booking-service");
//!
//! let bytes = envelope.to_bytes().unwrap();
//! let decoded = Envelope::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded.data["bookingId"], "abc123");
//! ```

use crate::error::EventBusError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The unit of transmission on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `booking.completed`
    #[serde(rename = "type", alias = "eventName")]
    pub event_type: String,

    /// Arbitrary JSON payload
    #[serde(default)]
    pub data: Value,

    /// When the event was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Name of the originating service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

impl Envelope {
    /// Create an envelope with no timestamp and no originating service.
    ///
    /// The publisher fills both in from its clock and configuration.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: None,
            service: String::new(),
        }
    }

    /// Set the originating service name.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Set the production timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(self).map_err(|e| EventBusError::Serialization(e.to_string()))
    }

    /// Decode a delivered message body.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedMessage`] if the body is not a JSON
    /// envelope or has an empty event name.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventBusError> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| EventBusError::MalformedMessage(e.to_string()))?;

        if envelope.event_type.is_empty() {
            return Err(EventBusError::MalformedMessage(
                "event type is empty".to_string(),
            ));
        }

        Ok(envelope)
    }

    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedMessage`] if `data` does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, EventBusError> {
        T::deserialize(&self.data).map_err(|e| {
            EventBusError::MalformedMessage(format!(
                "payload of '{}' does not match expected shape: {e}",
                self.event_type
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_type_key_and_reads_event_name_alias() {
        let bytes = Envelope::new("user.deleted", json!({ "userId": 7 }))
            .to_bytes()
            .unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["type"], "user.deleted");
        assert!(raw.get("timestamp").is_none());
        assert!(raw.get("service").is_none());

        let legacy = br#"{"eventName":"payment.succeeded","data":{"amount":120}}"#;
        let envelope = Envelope::from_bytes(legacy).unwrap();
        assert_eq!(envelope.event_type, "payment.succeeded");
        assert_eq!(envelope.data["amount"], 120);
    }

    #[test]
    fn payload_types_survive_the_wire() {
        let data = json!({
            "int": 42,
            "float": 12.5,
            "negative": -3,
            "text": "héllo",
            "flag": true,
            "nothing": null,
            "nested": { "list": [1, "two", false, null, { "deep": [] }] }
        });
        let envelope = Envelope::new("listing.updated", data.clone())
            .with_service("listing-service")
            .with_timestamp(
                DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            );

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.data, data);
        assert!(decoded.data["int"].is_i64());
        assert!(decoded.data["float"].is_f64());
    }

    #[test]
    fn rejects_malformed_bodies() {
        let bodies: [&[u8]; 5] = [
            b"not json",
            b"",
            br#"{"data":{}}"#,
            br#"{"type":"","data":{}}"#,
            br#"{"type":42}"#,
        ];
        for body in bodies {
            let result = Envelope::from_bytes(body);
            assert!(
                matches!(result, Err(EventBusError::MalformedMessage(_))),
                "expected malformed for {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let envelope = Envelope::from_bytes(br#"{"type":"ping"}"#).unwrap();
        assert!(envelope.data.is_null());
    }

    #[test]
    fn typed_payload_decoding() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct BookingCompleted {
            booking_id: String,
        }

        let envelope = Envelope::new("booking.completed", json!({ "bookingId": "abc123" }));
        let payload: BookingCompleted = envelope.data_as().unwrap();
        assert_eq!(payload.booking_id, "abc123");

        let wrong = Envelope::new("booking.completed", json!({ "bookingId": 5 }));
        assert!(wrong.data_as::<BookingCompleted>().is_err());
    }
}
