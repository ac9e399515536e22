//! Handlers for the inbound catalog events
//!
//! Each handler validates its payload, maps it onto an enrollment trigger
//! and lets [`EnrollmentService`] commit the result.

use async_trait::async_trait;
use event_bus::EventEnvelope;
use std::sync::Arc;

use super::dispatcher::{EventHandler, HandlerError, HandlerRegistry};
use crate::enrollment::{EnrollmentService, EventTarget, Trigger};
use crate::events::catalog::{EventKind, LearningEvent};
use crate::repos::CommitOutcome;

fn unexpected(expected: EventKind, envelope: &EventEnvelope<LearningEvent>) -> HandlerError {
    HandlerError::Permanent(format!(
        "{} handler received {} payload",
        expected,
        envelope.payload.kind()
    ))
}

pub struct PaymentCompletedHandler {
    service: Arc<EnrollmentService>,
}

#[async_trait]
impl EventHandler for PaymentCompletedHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
    ) -> Result<CommitOutcome, HandlerError> {
        let LearningEvent::PaymentCompleted(payment) = &envelope.payload else {
            return Err(unexpected(EventKind::PaymentCompleted, envelope));
        };

        let target = EventTarget {
            user_id: payment.user_id.clone(),
            product_id: payment.product_id,
            scheduled_event_id: payment.scheduled_event_id,
        };

        Ok(self
            .service
            .apply_trigger(envelope, &target, Trigger::PaymentCompleted)
            .await?)
    }
}

pub struct EventScheduledHandler {
    service: Arc<EnrollmentService>,
}

#[async_trait]
impl EventHandler for EventScheduledHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
    ) -> Result<CommitOutcome, HandlerError> {
        let LearningEvent::EventScheduled(scheduled) = &envelope.payload else {
            return Err(unexpected(EventKind::EventScheduled, envelope));
        };

        if scheduled.end_time < scheduled.start_time {
            return Err(HandlerError::Permanent(format!(
                "session ends ({}) before it starts ({})",
                scheduled.end_time, scheduled.start_time
            )));
        }

        let target = EventTarget {
            user_id: scheduled.user_id.clone(),
            product_id: scheduled.product_id,
            scheduled_event_id: None,
        };
        let trigger = Trigger::SessionScheduled {
            start: scheduled.start_time,
            end: scheduled.end_time,
        };

        Ok(self.service.apply_trigger(envelope, &target, trigger).await?)
    }
}

pub struct BookingCanceledHandler {
    service: Arc<EnrollmentService>,
}

#[async_trait]
impl EventHandler for BookingCanceledHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
    ) -> Result<CommitOutcome, HandlerError> {
        let LearningEvent::BookingCanceled(canceled) = &envelope.payload else {
            return Err(unexpected(EventKind::BookingCanceled, envelope));
        };

        if let Some(reason) = &canceled.reason {
            tracing::info!(reason = %reason, "Booking canceled upstream");
        }

        let target = EventTarget {
            user_id: canceled.user_id.clone(),
            product_id: canceled.product_id,
            scheduled_event_id: canceled.scheduled_event_id,
        };

        Ok(self
            .service
            .apply_trigger(envelope, &target, Trigger::BookingCanceled)
            .await?)
    }
}

pub struct EducatorProfileUpdatedHandler {
    service: Arc<EnrollmentService>,
}

#[async_trait]
impl EventHandler for EducatorProfileUpdatedHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
    ) -> Result<CommitOutcome, HandlerError> {
        let LearningEvent::EducatorProfileUpdated(update) = &envelope.payload else {
            return Err(unexpected(EventKind::EducatorProfileUpdated, envelope));
        };

        if update.user_id.trim().is_empty() {
            return Err(HandlerError::Permanent("profile update without user_id".to_string()));
        }

        Ok(self.service.apply_profile_update(envelope, update).await?)
    }
}

/// Registry with a handler for every inbound event kind
pub fn learning_handlers(service: Arc<EnrollmentService>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            EventKind::PaymentCompleted,
            Arc::new(PaymentCompletedHandler {
                service: service.clone(),
            }),
        )
        .register(
            EventKind::EventScheduled,
            Arc::new(EventScheduledHandler {
                service: service.clone(),
            }),
        )
        .register(
            EventKind::BookingCanceled,
            Arc::new(BookingCanceledHandler {
                service: service.clone(),
            }),
        )
        .register(
            EventKind::EducatorProfileUpdated,
            Arc::new(EducatorProfileUpdatedHandler { service }),
        )
}
