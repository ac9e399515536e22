pub mod catalog;
pub mod dlq;
pub mod outbox;
pub mod publisher;

pub use catalog::{decode_envelope, DecodeError, Direction, EventKind, LearningEvent};
pub use dlq::{DeadLetterReason, DeadLetterRecord, DeadLetterSink};
pub use outbox::{announce_product_created, build_outbox_record, OutboxRelay, OUTBOX_BATCH_SIZE};
pub use publisher::{EventPublisher, PublishError};

use event_bus::EventEnvelope;

/// `source_module` stamped on every event this service produces
pub const SOURCE_MODULE: &str = "learning";

/// Start a new causal chain for an outbound event
pub fn new_envelope(event: LearningEvent) -> EventEnvelope<LearningEvent> {
    EventEnvelope::new(
        event.kind().as_str().to_string(),
        SOURCE_MODULE.to_string(),
        event,
    )
}
