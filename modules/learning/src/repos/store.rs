//! Storage contract for enrollments, the processed-event ledger and the outbox.
//!
//! Everything an event handler changes goes through [`EnrollmentStore::commit`]
//! as one [`UnitOfWork`]: the ledger insert, the enrollment mutations and the
//! outbound events land in a single transaction or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{EducatorProfile, Enrollment, EnrollmentStatus, NewEnrollment};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-set lost against a concurrent writer
    #[error("concurrent modification: {0}")]
    Conflict(String),

    /// A uniqueness rule rejected the write
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt row: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Serialization(_) | StoreError::AlreadyExists(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger row recorded for a consumed event
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event_id: Uuid,
    pub event_type: String,
    pub processor: String,
}

/// A single state change applied inside a commit
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Move an enrollment from `from` to `to`; fails if the stored status is not `from`
    Transition {
        enrollment_id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
        at: DateTime<Utc>,
    },
    /// Attach the booked session window; only valid while the enrollment is active
    AttachSession {
        enrollment_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// Replace the educator profile unless a newer version is already stored
    UpsertEducatorProfile(EducatorProfile),
}

/// Outbound event waiting to be relayed to the bus
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub envelope: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutbox {
    pub id: i64,
    pub event_id: Uuid,
    pub subject: String,
    pub envelope: serde_json::Value,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub ledger: Option<LedgerEntry>,
    pub mutations: Vec<Mutation>,
    pub outbox: Vec<OutboxRecord>,
}

impl UnitOfWork {
    pub fn for_event(entry: LedgerEntry) -> Self {
        Self {
            ledger: Some(entry),
            ..Self::default()
        }
    }

    pub fn mutate(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn emit(mut self, record: OutboxRecord) -> Self {
        self.outbox.push(record);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The ledger already held the event id; nothing was written
    Duplicate,
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn insert_enrollment(&self, new: NewEnrollment) -> StoreResult<Enrollment>;

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>>;

    /// Enrollments of `user_id` for `product_id`, narrowed to one session when
    /// `scheduled_event_id` is given
    async fn find_enrollments(
        &self,
        user_id: &str,
        product_id: i64,
        scheduled_event_id: Option<i64>,
    ) -> StoreResult<Vec<Enrollment>>;

    async fn get_educator_profile(&self, user_id: &str) -> StoreResult<Option<EducatorProfile>>;

    async fn is_processed(&self, event_id: Uuid) -> StoreResult<bool>;

    /// Apply a unit of work atomically
    ///
    /// The ledger entry (if any) is written first. A duplicate event id yields
    /// `CommitOutcome::Duplicate` with nothing written; a failed
    /// compare-and-set yields `StoreError::Conflict` with nothing written.
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome>;

    /// Claim up to `limit` rows for publishing
    ///
    /// Pending rows are claimed, along with rows whose earlier claim is older
    /// than `lease`. A claimed row is not handed to another caller until it is
    /// reported back or its lease runs out.
    async fn claim_pending_outbox(
        &self,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<PendingOutbox>>;

    async fn mark_outbox_published(&self, id: i64) -> StoreResult<()>;

    /// Record a failed relay attempt on a claimed row; it returns to pending,
    /// or is parked as `failed` once `max_retries` attempts have been made
    async fn mark_outbox_failed(&self, id: i64, error: &str, max_retries: i32) -> StoreResult<()>;

    /// Drop ledger entries processed before `older_than`, returning how many
    async fn prune_processed(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}
