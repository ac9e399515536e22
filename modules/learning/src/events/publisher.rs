//! Outbound publisher
//!
//! Hands a serialized envelope to the bus on the routing key of its event
//! type. One attempt only: redelivery of outbound events is the outbox
//! relay's job.

use event_bus::{BusError, BusMessage, EventBus, EventEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::LearningEvent;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("event bus rejected publish: {0}")]
    Bus(#[from] BusError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Publish a typed envelope on the routing key of its `event_type`
    pub async fn publish(&self, envelope: &EventEnvelope<LearningEvent>) -> Result<(), PublishError> {
        let kind = envelope.payload.kind();
        if envelope.event_type != kind.as_str() {
            return Err(PublishError::Serialization(format!(
                "event_type {} does not match {} payload",
                envelope.event_type, kind
            )));
        }

        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let headers = HashMap::from([
            ("event-id".to_string(), envelope.event_id.to_string()),
            ("event-type".to_string(), envelope.event_type.clone()),
            ("correlation-id".to_string(), envelope.correlation_id.clone()),
        ]);

        self.send(kind.routing_key(), headers, bytes).await
    }

    async fn send(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        let msg = BusMessage::new(subject.to_string(), payload).with_headers(headers);

        tokio::time::timeout(self.timeout, self.bus.publish_message(msg))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))??;

        tracing::debug!(subject = %subject, "Event published");
        Ok(())
    }
}
