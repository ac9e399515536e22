//! Transactional outbox
//!
//! Outbound events are written to the outbox inside the transaction that
//! produced them. [`OutboxRelay`] polls pending rows and publishes them,
//! parking a row as `failed` after the configured number of attempts.

use event_bus::EventEnvelope;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::catalog::{DecodeError, EducatorProductCreated, LearningEvent};
use super::new_envelope;
use super::publisher::EventPublisher;
use crate::metrics::Metrics;
use crate::repos::{
    EnrollmentStore, OutboxRecord, PendingOutbox, StoreError, StoreResult, UnitOfWork,
};

/// Rows claimed per relay pass
pub const OUTBOX_BATCH_SIZE: i64 = 100;

pub fn build_outbox_record(
    envelope: &EventEnvelope<LearningEvent>,
) -> Result<OutboxRecord, StoreError> {
    let value =
        serde_json::to_value(envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(OutboxRecord {
        event_id: envelope.event_id,
        subject: envelope.payload.kind().routing_key().to_string(),
        envelope: value,
    })
}

/// Queue an `EDUCATOR_PRODUCT_CREATED` announcement
///
/// Joins `correlation_id`'s chain when given, otherwise starts a new one.
/// Returns the id of the queued event.
pub async fn announce_product_created(
    store: &dyn EnrollmentStore,
    user_id: &str,
    correlation_id: Option<String>,
) -> StoreResult<Uuid> {
    let mut envelope = new_envelope(LearningEvent::EducatorProductCreated(
        EducatorProductCreated {
            user_id: user_id.to_string(),
        },
    ));
    if let Some(correlation_id) = correlation_id {
        envelope = envelope.with_correlation_id(correlation_id);
    }

    store
        .commit(UnitOfWork::default().emit(build_outbox_record(&envelope)?))
        .await?;

    tracing::info!(
        event_id = %envelope.event_id,
        user_id = %user_id,
        correlation_id = %envelope.correlation_id,
        "Educator product announcement queued"
    );

    Ok(envelope.event_id)
}

/// Rebuild the typed envelope a row was written from
fn restore_envelope(row: &PendingOutbox) -> Result<EventEnvelope<LearningEvent>, DecodeError> {
    let raw: EventEnvelope<serde_json::Value> = serde_json::from_value(row.envelope.clone())
        .map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))?;
    let event = LearningEvent::decode(&raw.event_type, raw.payload.clone())?;

    if event.kind().routing_key() != row.subject {
        return Err(DecodeError::InvalidEnvelope(format!(
            "{} does not route to {}",
            raw.event_type, row.subject
        )));
    }

    Ok(raw.map_payload(|_| event))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn EnrollmentStore>,
    publisher: EventPublisher,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    max_retries: i32,
    claim_lease: Duration,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        publisher: EventPublisher,
        metrics: Arc<Metrics>,
        poll_interval: Duration,
        max_retries: i32,
        claim_lease: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            metrics,
            poll_interval,
            max_retries,
            claim_lease,
        }
    }

    /// Claim one batch of pending rows and publish it
    pub async fn relay_once(&self) -> StoreResult<RelaySummary> {
        let pending = self
            .store
            .claim_pending_outbox(OUTBOX_BATCH_SIZE, self.claim_lease)
            .await?;
        let mut summary = RelaySummary::default();

        if pending.is_empty() {
            return Ok(summary);
        }

        tracing::debug!("Publishing {} events from outbox", pending.len());

        for row in pending {
            let envelope = match restore_envelope(&row) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Retrying cannot repair a stored envelope
                    self.store.mark_outbox_failed(row.id, &e.to_string(), 1).await?;
                    self.metrics
                        .learning_outbox_published_total
                        .with_label_values(&["error"])
                        .inc();
                    summary.failed += 1;

                    tracing::error!(
                        event_id = %row.event_id,
                        subject = %row.subject,
                        error = %e,
                        "Outbox row is not a publishable event, parked as failed"
                    );
                    continue;
                }
            };

            match self.publisher.publish(&envelope).await {
                Ok(()) => {
                    self.store.mark_outbox_published(row.id).await?;
                    self.metrics
                        .learning_outbox_published_total
                        .with_label_values(&["ok"])
                        .inc();
                    summary.published += 1;

                    tracing::info!(
                        event_id = %row.event_id,
                        subject = %row.subject,
                        "Outbox event published"
                    );
                }
                Err(e) => {
                    self.store
                        .mark_outbox_failed(row.id, &e.to_string(), self.max_retries)
                        .await?;
                    self.metrics
                        .learning_outbox_published_total
                        .with_label_values(&["error"])
                        .inc();
                    summary.failed += 1;

                    if row.retry_count + 1 >= self.max_retries {
                        tracing::error!(
                            event_id = %row.event_id,
                            subject = %row.subject,
                            retry_count = row.retry_count + 1,
                            error = %e,
                            "Outbox event parked as failed, needs reconciliation"
                        );
                    } else {
                        tracing::warn!(
                            event_id = %row.event_id,
                            subject = %row.subject,
                            retry_count = row.retry_count + 1,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Poll forever
    pub async fn run(self) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_retries = self.max_retries,
            "Starting outbox relay"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.relay_once().await {
                tracing::error!(error = %e, "Outbox relay pass failed");
            }
        }
    }
}
