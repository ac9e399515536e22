//! In-memory [`EnrollmentStore`] for tests and local development.
//!
//! A single async mutex stands in for the database transaction, so commits
//! keep the same all-or-nothing behavior as the Postgres store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{
    CommitOutcome, EnrollmentStore, Mutation, PendingOutbox, StoreError, StoreResult, UnitOfWork,
};
use crate::models::{EducatorProfile, Enrollment, EnrollmentStatus, NewEnrollment};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    /// Claimed by a relay pass that has not reported back yet
    Publishing,
    Published,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub event_id: Uuid,
    pub subject: String,
    pub envelope: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LedgerRow {
    event_type: String,
    processed_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    enrollments: HashMap<Uuid, Enrollment>,
    ledger: HashMap<Uuid, LedgerRow>,
    profiles: HashMap<String, EducatorProfile>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
    failures_to_inject: u32,
}

#[derive(Default)]
pub struct InMemoryEnrollmentStore {
    state: Mutex<State>,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `StoreError::Unavailable`
    pub async fn inject_commit_failures(&self, count: u32) {
        self.state.lock().await.failures_to_inject = count;
    }

    pub async fn enrollment_count(&self) -> usize {
        self.state.lock().await.enrollments.len()
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    pub async fn ledger_event_type(&self, event_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .ledger
            .get(&event_id)
            .map(|row| row.event_type.clone())
    }

    /// Backdate a ledger entry (retention tests)
    pub async fn set_processed_at(&self, event_id: Uuid, processed_at: DateTime<Utc>) {
        if let Some(row) = self.state.lock().await.ledger.get_mut(&event_id) {
            row.processed_at = processed_at;
        }
    }

    pub async fn outbox_rows(&self) -> Vec<OutboxRow> {
        self.state.lock().await.outbox.clone()
    }
}

/// Check a mutation against the working copy and apply it there
fn apply_mutation(state: &mut State, mutation: &Mutation) -> StoreResult<()> {
    match mutation {
        Mutation::Transition {
            enrollment_id,
            from,
            to,
            at,
        } => {
            let enrollment = state
                .enrollments
                .get_mut(enrollment_id)
                .ok_or_else(|| StoreError::Conflict(format!("enrollment {} vanished", enrollment_id)))?;
            if enrollment.status != *from {
                return Err(StoreError::Conflict(format!(
                    "enrollment {} is {}, expected {}",
                    enrollment_id, enrollment.status, from
                )));
            }
            enrollment.status = *to;
            enrollment.updated_at = enrollment.updated_at.max(*at);
        }
        Mutation::AttachSession {
            enrollment_id,
            start,
            end,
            at,
        } => {
            let enrollment = state
                .enrollments
                .get_mut(enrollment_id)
                .ok_or_else(|| StoreError::Conflict(format!("enrollment {} vanished", enrollment_id)))?;
            if enrollment.status != EnrollmentStatus::Active {
                return Err(StoreError::Conflict(format!(
                    "enrollment {} is {}, expected active",
                    enrollment_id, enrollment.status
                )));
            }
            enrollment.session_start = Some(*start);
            enrollment.session_end = Some(*end);
            enrollment.updated_at = enrollment.updated_at.max(*at);
        }
        Mutation::UpsertEducatorProfile(profile) => {
            let newer = state
                .profiles
                .get(&profile.user_id)
                .map_or(true, |current| current.source_timestamp < profile.source_timestamp);
            if newer {
                state
                    .profiles
                    .insert(profile.user_id.clone(), profile.clone());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl EnrollmentStore for InMemoryEnrollmentStore {
    async fn insert_enrollment(&self, new: NewEnrollment) -> StoreResult<Enrollment> {
        let now = Utc::now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            product_id: new.product_id,
            scheduled_event_id: new.scheduled_event_id,
            status: EnrollmentStatus::Active,
            session_start: None,
            session_end: None,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        let taken = state.enrollments.values().any(|e| {
            e.status == EnrollmentStatus::Active
                && e.user_id == enrollment.user_id
                && e.product_id == enrollment.product_id
                && e.scheduled_event_id == enrollment.scheduled_event_id
        });
        if taken {
            return Err(StoreError::AlreadyExists(format!(
                "active enrollment for {} on product {}",
                enrollment.user_id, enrollment.product_id
            )));
        }
        state.enrollments.insert(enrollment.id, enrollment.clone());

        Ok(enrollment)
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        Ok(self.state.lock().await.enrollments.get(&id).cloned())
    }

    async fn find_enrollments(
        &self,
        user_id: &str,
        product_id: i64,
        scheduled_event_id: Option<i64>,
    ) -> StoreResult<Vec<Enrollment>> {
        let state = self.state.lock().await;
        let mut found: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.user_id == user_id && e.product_id == product_id)
            .filter(|e| scheduled_event_id.is_none() || e.scheduled_event_id == scheduled_event_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }

    async fn get_educator_profile(&self, user_id: &str) -> StoreResult<Option<EducatorProfile>> {
        Ok(self.state.lock().await.profiles.get(user_id).cloned())
    }

    async fn is_processed(&self, event_id: Uuid) -> StoreResult<bool> {
        Ok(self.state.lock().await.ledger.contains_key(&event_id))
    }

    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome> {
        let mut state = self.state.lock().await;

        if state.failures_to_inject > 0 {
            state.failures_to_inject -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        if let Some(entry) = &unit.ledger {
            if state.ledger.contains_key(&entry.event_id) {
                return Ok(CommitOutcome::Duplicate);
            }
        }

        // Work on a copy so a failed compare-and-set leaves nothing behind
        let mut working = State {
            enrollments: state.enrollments.clone(),
            profiles: state.profiles.clone(),
            ..State::default()
        };
        for mutation in &unit.mutations {
            apply_mutation(&mut working, mutation)?;
        }
        state.enrollments = working.enrollments;
        state.profiles = working.profiles;

        for record in unit.outbox {
            state.next_outbox_id += 1;
            let id = state.next_outbox_id;
            state.outbox.push(OutboxRow {
                id,
                event_id: record.event_id,
                subject: record.subject,
                envelope: record.envelope,
                status: OutboxStatus::Pending,
                retry_count: 0,
                error_message: None,
                claimed_at: None,
            });
        }

        if let Some(entry) = unit.ledger {
            state.ledger.insert(
                entry.event_id,
                LedgerRow {
                    event_type: entry.event_type,
                    processed_at: Utc::now(),
                },
            );
        }

        Ok(CommitOutcome::Applied)
    }

    async fn claim_pending_outbox(
        &self,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<PendingOutbox>> {
        let now = Utc::now();
        // A lease too long to represent never expires
        let expired_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease));
        let mut state = self.state.lock().await;

        Ok(state
            .outbox
            .iter_mut()
            .filter(|row| match row.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Publishing => matches!(
                    (row.claimed_at, expired_before),
                    (Some(at), Some(cutoff)) if at < cutoff
                ),
                _ => false,
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|row| {
                row.status = OutboxStatus::Publishing;
                row.claimed_at = Some(now);
                PendingOutbox {
                    id: row.id,
                    event_id: row.event_id,
                    subject: row.subject.clone(),
                    envelope: row.envelope.clone(),
                    retry_count: row.retry_count,
                }
            })
            .collect())
    }

    async fn mark_outbox_published(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.outbox.iter_mut().find(|row| row.id == id) {
            row.status = OutboxStatus::Published;
            row.claimed_at = None;
        }
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, error: &str, max_retries: i32) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state
            .outbox
            .iter_mut()
            .find(|row| row.id == id && row.status == OutboxStatus::Publishing)
        {
            row.retry_count += 1;
            row.error_message = Some(error.to_string());
            row.claimed_at = None;
            row.status = if row.retry_count >= max_retries {
                OutboxStatus::Failed
            } else {
                OutboxStatus::Pending
            };
        }
        Ok(())
    }

    async fn prune_processed(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.ledger.len();
        state.ledger.retain(|_, row| row.processed_at >= older_than);
        Ok((before - state.ledger.len()) as u64)
    }
}
