//! # Event Envelope
//!
//! Wire contract shared by every service that talks over the bus.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier, used as the idempotency key by consumers
//! - `event_type`: Tag naming the payload schema (e.g. `PAYMENT_COMPLETED`)
//! - `correlation_id`: Shared by every event of one causal chain
//! - `timestamp`: ISO 8601 time the event was created, never rewritten
//! - `source_module`: Service that produced the event
//! - `causation_id`: `event_id` of the event that directly caused this one
//! - `payload`: Event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PaymentCompleted {
///     user_id: String,
///     product_id: i64,
/// }
///
/// let origin = EventEnvelope::new(
///     "PAYMENT_COMPLETED".to_string(),
///     "payments".to_string(),
///     PaymentCompleted { user_id: "u-1".to_string(), product_id: 42 },
/// );
///
/// // Downstream events keep the chain's correlation id
/// let follow_up = EventEnvelope::new("BOOKING_COMPLETED".to_string(), "learning".to_string(), ())
///     .caused_by(&origin);
/// assert_eq!(follow_up.correlation_id, origin.correlation_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Payload schema tag
    pub event_type: String,

    /// Links all events of one business transaction
    pub correlation_id: String,

    /// ISO 8601 timestamp when the event was generated
    pub timestamp: DateTime<Utc>,

    /// Service that generated the event
    #[serde(default)]
    pub source_module: String,

    /// Links this event to the event that caused it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create the first envelope of a new causal chain
    ///
    /// `event_id`, `timestamp` and a fresh `correlation_id` are generated.
    pub fn new(event_type: String, source_module: String, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source_module,
            causation_id: None,
            payload,
        }
    }

    /// Override the generated event id (replays and tests)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Join an existing causal chain
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Mark this envelope as a consequence of `parent`
    pub fn caused_by<P>(self, parent: &EventEnvelope<P>) -> Self {
        self.with_correlation_id(parent.correlation_id.clone())
            .with_causation_id(Some(parent.event_id.to_string()))
    }

    /// Transform the payload, keeping every envelope field
    pub fn map_payload<U, F: FnOnce(T) -> U>(self, f: F) -> EventEnvelope<U> {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
            source_module: self.source_module,
            causation_id: self.causation_id,
            payload: f(self.payload),
        }
    }
}

/// Validate the envelope fields of an untyped message
///
/// # Validation Rules
///
/// - `event_id`: Must be a valid UUID
/// - `event_type`: Must be non-empty
/// - `correlation_id`: Must be non-empty
/// - `timestamp`: Must be an RFC 3339 timestamp
/// - `payload`: Must be present
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;
    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {}", e))?;

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;
    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    let correlation_id = envelope
        .get("correlation_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid correlation_id")?;
    if correlation_id.is_empty() {
        return Err("correlation_id cannot be empty".to_string());
    }

    let timestamp = envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;
    DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("timestamp is not RFC 3339: {}", e))?;

    if envelope.get("payload").is_none() {
        return Err("Missing payload".to_string());
    }

    Ok(())
}
