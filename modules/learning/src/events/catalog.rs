//! Closed catalog of the events the learning service emits and consumes.
//!
//! Every event type has one fixed routing key. Decoding is a two-step
//! affair: the envelope is parsed with an untyped payload, then the
//! `event_type` tag selects the payload schema.

use chrono::{DateTime, Utc};
use event_bus::{validate_envelope_fields, EventEnvelope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EducatorProductCreated,
    EducatorProfileUpdated,
    PaymentCompleted,
    EventScheduled,
    BookingCompleted,
    BookingCanceled,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::EducatorProductCreated,
        EventKind::EducatorProfileUpdated,
        EventKind::PaymentCompleted,
        EventKind::EventScheduled,
        EventKind::BookingCompleted,
        EventKind::BookingCanceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EducatorProductCreated => "EDUCATOR_PRODUCT_CREATED",
            EventKind::EducatorProfileUpdated => "EDUCATOR_PROFILE_UPDATED",
            EventKind::PaymentCompleted => "PAYMENT_COMPLETED",
            EventKind::EventScheduled => "EVENT_SCHEDULED",
            EventKind::BookingCompleted => "BOOKING_COMPLETED",
            EventKind::BookingCanceled => "BOOKING_CANCELED",
        }
    }

    pub fn from_str(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == event_type)
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            EventKind::EducatorProductCreated => "learning.to.catalog.educator_product_created",
            EventKind::EducatorProfileUpdated => "profile.to.learning.educator_profile_updated",
            EventKind::PaymentCompleted => "payment.to.learning.payment_completed",
            EventKind::EventScheduled => "scheduling.to.learning.event_scheduled",
            EventKind::BookingCompleted => "learning.to.scheduling.booking_completed",
            EventKind::BookingCanceled => "scheduling.to.learning.booking_canceled",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            EventKind::EducatorProductCreated | EventKind::BookingCompleted => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject patterns the consumer subscribes to
pub const INBOUND_SUBJECTS: [&str; 3] = [
    "payment.to.learning.*",
    "scheduling.to.learning.*",
    "profile.to.learning.*",
];

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducatorProductCreated {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducatorProfileUpdated {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub user_id: String,
    pub product_id: i64,
    #[serde(default)]
    pub scheduled_event_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventScheduled {
    pub user_id: String,
    pub product_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCompleted {
    pub user_id: String,
    pub enrollment_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCanceled {
    pub user_id: String,
    pub product_id: i64,
    #[serde(default)]
    pub scheduled_event_id: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Payload of any catalog event
///
/// Serializes as the bare payload object; the variant is carried by the
/// envelope's `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LearningEvent {
    EducatorProductCreated(EducatorProductCreated),
    EducatorProfileUpdated(EducatorProfileUpdated),
    PaymentCompleted(PaymentCompleted),
    EventScheduled(EventScheduled),
    BookingCompleted(BookingCompleted),
    BookingCanceled(BookingCanceled),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

impl LearningEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LearningEvent::EducatorProductCreated(_) => EventKind::EducatorProductCreated,
            LearningEvent::EducatorProfileUpdated(_) => EventKind::EducatorProfileUpdated,
            LearningEvent::PaymentCompleted(_) => EventKind::PaymentCompleted,
            LearningEvent::EventScheduled(_) => EventKind::EventScheduled,
            LearningEvent::BookingCompleted(_) => EventKind::BookingCompleted,
            LearningEvent::BookingCanceled(_) => EventKind::BookingCanceled,
        }
    }

    /// Decode a payload according to its `event_type` tag
    pub fn decode(event_type: &str, payload: serde_json::Value) -> Result<Self, DecodeError> {
        let kind = EventKind::from_str(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))?;

        let invalid = |e: serde_json::Error| DecodeError::InvalidPayload {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        };

        let event = match kind {
            EventKind::EducatorProductCreated => {
                LearningEvent::EducatorProductCreated(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventKind::EducatorProfileUpdated => {
                LearningEvent::EducatorProfileUpdated(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventKind::PaymentCompleted => {
                LearningEvent::PaymentCompleted(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventKind::EventScheduled => {
                LearningEvent::EventScheduled(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventKind::BookingCompleted => {
                LearningEvent::BookingCompleted(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventKind::BookingCanceled => {
                LearningEvent::BookingCanceled(serde_json::from_value(payload).map_err(invalid)?)
            }
        };

        Ok(event)
    }
}

/// Decode raw message bytes into a typed envelope
pub fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope<LearningEvent>, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    validate_envelope_fields(&value).map_err(DecodeError::InvalidEnvelope)?;

    let raw: EventEnvelope<serde_json::Value> =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))?;

    let event = LearningEvent::decode(&raw.event_type, raw.payload.clone())?;
    Ok(raw.map_payload(|_| event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_envelope(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_id": Uuid::new_v4(),
            "event_type": event_type,
            "correlation_id": "corr-1",
            "timestamp": "2026-03-01T10:00:00Z",
            "source_module": "payments",
            "payload": payload,
        }))
        .unwrap()
    }

    #[test]
    fn test_routing_keys_are_unique_and_namespaced() {
        let mut keys: Vec<&str> = EventKind::ALL.iter().map(|k| k.routing_key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), EventKind::ALL.len());

        for kind in EventKind::ALL {
            match kind.direction() {
                Direction::Outbound => assert!(kind.routing_key().starts_with("learning.to.")),
                Direction::Inbound => assert!(kind.routing_key().contains(".to.learning.")),
            }
        }
    }

    #[test]
    fn test_event_type_tags_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_str("payment_completed"), None);
    }

    #[test]
    fn test_decode_payment_completed_without_session() {
        let envelope = decode_envelope(&raw_envelope(
            "PAYMENT_COMPLETED",
            json!({"user_id": "learner-1", "product_id": 42}),
        ))
        .unwrap();

        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(
            envelope.payload,
            LearningEvent::PaymentCompleted(PaymentCompleted {
                user_id: "learner-1".to_string(),
                product_id: 42,
                scheduled_event_id: None,
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let result = decode_envelope(&raw_envelope("COURSE_ARCHIVED", json!({})));
        assert!(matches!(result, Err(DecodeError::UnknownEventType(t)) if t == "COURSE_ARCHIVED"));
    }

    #[test]
    fn test_decode_rejects_payload_of_wrong_shape() {
        let result = decode_envelope(&raw_envelope(
            "EVENT_SCHEDULED",
            json!({"user_id": "learner-1", "product_id": 42, "start_time": "soon"}),
        ));
        assert!(matches!(result, Err(DecodeError::InvalidPayload { .. })));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_envelope(b"not json at all"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_envelope(br#"{"event_type": "PAYMENT_COMPLETED"}"#),
            Err(DecodeError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_payload_serializes_without_variant_tag() {
        let event = LearningEvent::BookingCompleted(BookingCompleted {
            user_id: "learner-1".to_string(),
            enrollment_id: Uuid::nil(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"user_id": "learner-1", "enrollment_id": Uuid::nil()})
        );
    }
}
