//! Dead-letter sink
//!
//! Messages that cannot be processed are published to a single subject with
//! the original payload and the failure context, for inspection and replay.

use chrono::{DateTime, Utc};
use event_bus::{BusMessage, BusResult, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload could not be decoded into an envelope
    Malformed,
    /// No handler is registered for the event type
    UnknownEventType,
    /// Transient failures reached the attempt ceiling
    RetriesExhausted,
    /// Handler reported a failure retrying cannot fix
    Permanent,
    /// A retry was due but the message could not be put back on the bus
    RedeliveryFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::UnknownEventType => "unknown_event_type",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::Permanent => "permanent",
            DeadLetterReason::RedeliveryFailed => "redelivery_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub subject: String,
    /// Original payload; a string when it was not valid JSON
    pub payload: serde_json::Value,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_message(
        msg: &BusMessage,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let payload = serde_json::from_slice::<serde_json::Value>(&msg.payload).unwrap_or_else(
            |_| serde_json::Value::String(String::from_utf8_lossy(&msg.payload).into_owned()),
        );

        let field = |name: &str| {
            payload
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Self {
            subject: msg.subject.clone(),
            event_id: field("event_id"),
            event_type: field("event_type"),
            correlation_id: field("correlation_id"),
            payload,
            reason,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct DeadLetterSink {
    bus: Arc<dyn EventBus>,
    subject: String,
}

impl DeadLetterSink {
    pub fn new(bus: Arc<dyn EventBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn publish(&self, record: &DeadLetterRecord) -> BusResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| event_bus::BusError::SerializationError(e.to_string()))?;

        let mut msg = BusMessage::new(self.subject.clone(), bytes)
            .with_header("dead-letter-reason", record.reason.as_str());
        if let Some(event_id) = &record.event_id {
            msg = msg.with_header("event-id", event_id.as_str());
        }

        self.bus.publish_message(msg).await?;

        tracing::warn!(
            event_id = %record.event_id.as_deref().unwrap_or("unknown"),
            event_type = %record.event_type.as_deref().unwrap_or("unknown"),
            subject = %record.subject,
            reason = record.reason.as_str(),
            attempts = record.attempts,
            error = %record.error,
            "Event moved to DLQ"
        );

        Ok(())
    }
}
