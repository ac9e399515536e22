//! Inbound dispatcher
//!
//! Turns one delivered message into a [`Disposition`]: acknowledge it,
//! redeliver it later, or dead-letter it. The dispatcher never touches the
//! bus itself; the worker applies the disposition.

use async_trait::async_trait;
use event_bus::{BusMessage, EventEnvelope, RetryConfig};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::events::catalog::{decode_envelope, DecodeError, EventKind, LearningEvent};
use crate::events::dlq::{DeadLetterReason, DeadLetterRecord};
use crate::repos::{CommitOutcome, EnrollmentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retrying later may succeed
    #[error("transient failure: {0}")]
    Transient(String),

    /// The event can never be applied
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            HandlerError::Transient(e.to_string())
        } else {
            HandlerError::Permanent(e.to_string())
        }
    }
}

/// Applies one kind of event
///
/// Implementations commit the ledger entry together with their state
/// changes and report whether the commit found the event already applied.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
    ) -> Result<CommitOutcome, HandlerError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: EventKind) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.handlers.keys().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Processed,
    /// Already in the ledger; the handler did not run or its commit lost the race
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack(Ack),
    Retry {
        next_attempt: u32,
        delay: Duration,
        error: String,
    },
    DeadLetter(Box<DeadLetterRecord>),
}

impl Disposition {
    /// Label used for the `outcome` metric
    pub fn outcome(&self) -> &'static str {
        match self {
            Disposition::Ack(Ack::Processed) => "processed",
            Disposition::Ack(Ack::Duplicate) => "duplicate",
            Disposition::Retry { .. } => "retried",
            Disposition::DeadLetter(_) => "dead_lettered",
        }
    }
}

/// Metric label for messages whose type is not in the catalog
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Catalog name of the event kind, [`UNKNOWN_EVENT_TYPE`] otherwise
    ///
    /// Only catalog names are used here: the value becomes a metric label.
    pub event_type: &'static str,
    pub disposition: Disposition,
}

pub struct Dispatcher {
    registry: HandlerRegistry,
    store: Arc<dyn EnrollmentStore>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, store: Arc<dyn EnrollmentStore>, retry: RetryConfig) -> Self {
        Self {
            registry,
            store,
            retry,
        }
    }

    pub async fn dispatch<R: Rng + Send>(&self, msg: &BusMessage, rng: &mut R) -> Dispatched {
        let attempt = msg.delivery_attempt();
        let span = tracing::Span::current();

        let envelope = match decode_envelope(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = match e {
                    DecodeError::UnknownEventType(_) => DeadLetterReason::UnknownEventType,
                    _ => DeadLetterReason::Malformed,
                };
                let record = DeadLetterRecord::from_message(msg, reason, e.to_string(), attempt);
                tracing::warn!(error = %e, "Undecodable event, dead-lettering without retry");
                return Dispatched {
                    event_type: record
                        .event_type
                        .as_deref()
                        .and_then(EventKind::from_str)
                        .map_or(UNKNOWN_EVENT_TYPE, |kind| kind.as_str()),
                    disposition: Disposition::DeadLetter(Box::new(record)),
                };
            }
        };

        span.record("event_id", tracing::field::display(envelope.event_id));
        span.record("event_type", envelope.event_type.as_str());
        span.record("correlation_id", envelope.correlation_id.as_str());

        let kind = envelope.payload.kind();
        let dispatched = |disposition| Dispatched {
            event_type: kind.as_str(),
            disposition,
        };

        match self.store.is_processed(envelope.event_id).await {
            Ok(true) => {
                tracing::info!("Duplicate event skipped");
                return dispatched(Disposition::Ack(Ack::Duplicate));
            }
            Ok(false) => {}
            Err(e) => return dispatched(self.on_failure(msg, attempt, e.into(), rng)),
        }

        let Some(handler) = self.registry.get(kind) else {
            let error = format!("no handler registered for {}", envelope.event_type);
            tracing::warn!(error = %error, "Unhandled event type, dead-lettering without retry");
            return dispatched(Disposition::DeadLetter(Box::new(DeadLetterRecord::from_message(
                msg,
                DeadLetterReason::UnknownEventType,
                error,
                attempt,
            ))));
        };

        match handler.handle(&envelope).await {
            Ok(CommitOutcome::Applied) => dispatched(Disposition::Ack(Ack::Processed)),
            Ok(CommitOutcome::Duplicate) => {
                tracing::info!("Event was applied concurrently, acknowledging");
                dispatched(Disposition::Ack(Ack::Duplicate))
            }
            Err(e) => dispatched(self.on_failure(msg, attempt, e, rng)),
        }
    }

    fn on_failure<R: Rng>(
        &self,
        msg: &BusMessage,
        attempt: u32,
        error: HandlerError,
        rng: &mut R,
    ) -> Disposition {
        match error {
            HandlerError::Permanent(reason) => {
                Disposition::DeadLetter(Box::new(DeadLetterRecord::from_message(
                    msg,
                    DeadLetterReason::Permanent,
                    reason,
                    attempt,
                )))
            }
            HandlerError::Transient(reason) if self.retry.is_exhausted(attempt) => {
                Disposition::DeadLetter(Box::new(DeadLetterRecord::from_message(
                    msg,
                    DeadLetterReason::RetriesExhausted,
                    reason,
                    attempt,
                )))
            }
            HandlerError::Transient(reason) => Disposition::Retry {
                next_attempt: attempt + 1,
                delay: self.retry.delay_for(attempt, rng),
                error: reason,
            },
        }
    }
}
