//! Enrollment service: synchronous creation and cancellation, plus the
//! state changes driven by inbound events.

use chrono::Utc;
use event_bus::EventEnvelope;
use std::sync::Arc;
use uuid::Uuid;

use super::state_machine::{Decision, Trigger};
use crate::booking::BookingMetadataResolver;
use crate::events::catalog::{BookingCompleted, EducatorProfileUpdated, LearningEvent};
use crate::events::{announce_product_created, build_outbox_record, new_envelope};
use crate::models::{
    AnnounceProductRequest, CreateEnrollmentRequest, EducatorProfile, Enrollment, EnrollmentStatus, NewEnrollment,
};
use crate::repos::{CommitOutcome, EnrollmentStore, LedgerEntry, Mutation, StoreError, UnitOfWork};

/// Processor name written to the ledger
pub const PROCESSOR: &str = "learning-enrollment";

const CANCEL_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("booking rejected: {0}")]
    BookingRejected(String),

    #[error("learner already holds an active enrollment for this booking")]
    AlreadyEnrolled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("enrollment {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which enrollments an inbound event applies to
#[derive(Debug, Clone, PartialEq)]
pub struct EventTarget {
    pub user_id: String,
    pub product_id: i64,
    /// Narrows the match to one session when present
    pub scheduled_event_id: Option<i64>,
}

pub struct EnrollmentService {
    store: Arc<dyn EnrollmentStore>,
    resolver: BookingMetadataResolver,
}

impl EnrollmentService {
    pub fn new(store: Arc<dyn EnrollmentStore>, resolver: BookingMetadataResolver) -> Self {
        Self { store, resolver }
    }

    pub fn store(&self) -> &Arc<dyn EnrollmentStore> {
        &self.store
    }

    /// Create an `Active` enrollment
    ///
    /// With a `scheduled_event_id` the session is resolved first; any problem
    /// rejects the booking before anything is written.
    pub async fn create_enrollment(
        &self,
        req: CreateEnrollmentRequest,
    ) -> Result<Enrollment, EnrollmentError> {
        if req.user_id.trim().is_empty() {
            return Err(EnrollmentError::BookingRejected(
                "user_id must not be empty".to_string(),
            ));
        }

        if let Some(scheduled_event_id) = req.scheduled_event_id {
            let metadata = self.resolver.resolve(scheduled_event_id).await;

            if !metadata.is_valid {
                let reason = metadata
                    .error_message
                    .unwrap_or_else(|| "session is not bookable".to_string());
                tracing::info!(
                    user_id = %req.user_id,
                    scheduled_event_id = scheduled_event_id,
                    reason = %reason,
                    "Booking rejected"
                );
                return Err(EnrollmentError::BookingRejected(reason));
            }

            if metadata.product_id != Some(req.product_id) {
                return Err(EnrollmentError::BookingRejected(format!(
                    "session {} does not belong to product {}",
                    scheduled_event_id, req.product_id
                )));
            }

            if let Some(educator_id) = &req.educator_id {
                if metadata.educator_id.as_deref() != Some(educator_id.as_str()) {
                    return Err(EnrollmentError::BookingRejected(format!(
                        "session {} is not hosted by educator {}",
                        scheduled_event_id, educator_id
                    )));
                }
            }
        }

        let existing = self
            .store
            .find_enrollments(&req.user_id, req.product_id, req.scheduled_event_id)
            .await?;
        if existing.iter().any(|e| {
            e.status == EnrollmentStatus::Active && e.scheduled_event_id == req.scheduled_event_id
        }) {
            return Err(EnrollmentError::AlreadyEnrolled);
        }

        // The store enforces the same rule; a concurrent request can slip past the check above
        let enrollment = self
            .store
            .insert_enrollment(NewEnrollment {
                user_id: req.user_id,
                product_id: req.product_id,
                scheduled_event_id: req.scheduled_event_id,
            })
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => EnrollmentError::AlreadyEnrolled,
                other => EnrollmentError::Store(other),
            })?;

        tracing::info!(
            enrollment_id = %enrollment.id,
            user_id = %enrollment.user_id,
            product_id = enrollment.product_id,
            "Enrollment created"
        );

        Ok(enrollment)
    }

    /// Queue `EDUCATOR_PRODUCT_CREATED` for the catalog
    pub async fn announce_product(
        &self,
        req: AnnounceProductRequest,
    ) -> Result<Uuid, EnrollmentError> {
        if req.user_id.trim().is_empty() {
            return Err(EnrollmentError::InvalidRequest(
                "user_id must not be empty".to_string(),
            ));
        }

        Ok(announce_product_created(self.store.as_ref(), &req.user_id, req.correlation_id).await?)
    }

    pub async fn get_enrollment(&self, id: Uuid) -> Result<Enrollment, EnrollmentError> {
        self.store
            .get_enrollment(id)
            .await?
            .ok_or(EnrollmentError::NotFound(id))
    }

    /// Administrative cancellation; terminal enrollments come back unchanged
    pub async fn cancel_enrollment(&self, id: Uuid) -> Result<Enrollment, EnrollmentError> {
        let mut last_conflict = None;

        for _ in 0..CANCEL_ATTEMPTS {
            let enrollment = self.get_enrollment(id).await?;

            let decision = enrollment.decide(&Trigger::AdminCancel, Utc::now());
            let Some(mutation) = decision.into_mutation(enrollment.id) else {
                return Ok(enrollment);
            };

            match self.store.commit(UnitOfWork::default().mutate(mutation)).await {
                Ok(_) => {
                    tracing::info!(enrollment_id = %id, "Enrollment canceled by administrator");
                    return self.get_enrollment(id).await;
                }
                Err(StoreError::Conflict(msg)) => {
                    tracing::debug!(enrollment_id = %id, conflict = %msg, "Cancel lost a race, retrying");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict(last_conflict.unwrap_or_default()).into())
    }

    /// Apply a lifecycle trigger from an inbound event to every matching enrollment
    ///
    /// The ledger entry, the status changes and any `BOOKING_COMPLETED`
    /// announcements commit together.
    pub async fn apply_trigger(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
        target: &EventTarget,
        trigger: Trigger,
    ) -> Result<CommitOutcome, StoreError> {
        let matches = self
            .store
            .find_enrollments(&target.user_id, target.product_id, target.scheduled_event_id)
            .await?;

        if matches.is_empty() {
            tracing::warn!(
                user_id = %target.user_id,
                product_id = target.product_id,
                scheduled_event_id = ?target.scheduled_event_id,
                "No enrollment matches event, acknowledging without effect"
            );
        }

        let now = Utc::now();
        let mut unit = UnitOfWork::for_event(ledger_entry(envelope));

        for enrollment in &matches {
            let decision = enrollment.decide(&trigger, now);

            if let Decision::Ignore { status } = &decision {
                tracing::info!(
                    enrollment_id = %enrollment.id,
                    status = %status,
                    "Enrollment is terminal, event ignored"
                );
                continue;
            }

            if decision.completes() {
                let announcement = new_envelope(LearningEvent::BookingCompleted(BookingCompleted {
                    user_id: enrollment.user_id.clone(),
                    enrollment_id: enrollment.id,
                }))
                .caused_by(envelope);
                unit = unit.emit(build_outbox_record(&announcement)?);
            }

            if let Some(mutation) = decision.into_mutation(enrollment.id) {
                unit = unit.mutate(mutation);
            }
        }

        let outcome = self.store.commit(unit).await?;

        if outcome == CommitOutcome::Applied {
            tracing::info!(
                matched = matches.len(),
                trigger = ?trigger,
                "Enrollment event applied"
            );
        }

        Ok(outcome)
    }

    /// Refresh the educator profile projection; older versions never win
    pub async fn apply_profile_update(
        &self,
        envelope: &EventEnvelope<LearningEvent>,
        update: &EducatorProfileUpdated,
    ) -> Result<CommitOutcome, StoreError> {
        let profile = EducatorProfile {
            user_id: update.user_id.clone(),
            first_name: update.first_name.clone(),
            last_name: update.last_name.clone(),
            image_url: update.image_url.clone(),
            source_timestamp: envelope.timestamp,
        };

        self.store
            .commit(
                UnitOfWork::for_event(ledger_entry(envelope))
                    .mutate(Mutation::UpsertEducatorProfile(profile)),
            )
            .await
    }
}

fn ledger_entry(envelope: &EventEnvelope<LearningEvent>) -> LedgerEntry {
    LedgerEntry {
        event_id: envelope.event_id,
        event_type: envelope.event_type.clone(),
        processor: PROCESSOR.to_string(),
    }
}
