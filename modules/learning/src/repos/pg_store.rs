//! Postgres-backed [`EnrollmentStore`]
//!
//! A commit runs in one transaction. The ledger insert is its first
//! statement, so two workers racing on the same event id serialize on the
//! `processed_events` primary key and the loser sees zero rows affected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::store::{
    CommitOutcome, EnrollmentStore, LedgerEntry, Mutation, OutboxRecord, PendingOutbox, StoreError,
    StoreResult, UnitOfWork,
};
use crate::models::{EducatorProfile, Enrollment, EnrollmentStatus, NewEnrollment};

#[derive(Clone)]
pub struct PgEnrollmentStore {
    pool: PgPool,
}

impl PgEnrollmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    user_id: String,
    product_id: i64,
    scheduled_event_id: Option<i64>,
    status: String,
    session_start: Option<DateTime<Utc>>,
    session_end: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        let status = EnrollmentStatus::from_str(&row.status).ok_or_else(|| {
            StoreError::Serialization(format!(
                "enrollment {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;

        Ok(Enrollment {
            id: row.id,
            user_id: row.user_id,
            product_id: row.product_id,
            scheduled_event_id: row.scheduled_event_id,
            status,
            session_start: row.session_start,
            session_end: row.session_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id: String,
    first_name: String,
    last_name: String,
    image_url: Option<String>,
    source_timestamp: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    event_id: Uuid,
    subject: String,
    envelope: serde_json::Value,
    retry_count: i32,
}

const ENROLLMENT_COLUMNS: &str = "id, user_id, product_id, scheduled_event_id, status, \
     session_start, session_end, created_at, updated_at";

/// Returns false when the event id is already in the ledger
async fn insert_ledger(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, event_type, processor)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(entry.event_id)
    .bind(&entry.event_type)
    .bind(&entry.processor)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn apply_mutation(
    tx: &mut Transaction<'_, Postgres>,
    mutation: &Mutation,
) -> StoreResult<()> {
    match mutation {
        Mutation::Transition {
            enrollment_id,
            from,
            to,
            at,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE enrollments
                SET status = $3, updated_at = GREATEST(updated_at, $4)
                WHERE id = $1 AND status = $2
                "#,
            )
            .bind(enrollment_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(at)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "enrollment {} is no longer {}",
                    enrollment_id, from
                )));
            }
        }
        Mutation::AttachSession {
            enrollment_id,
            start,
            end,
            at,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE enrollments
                SET session_start = $2, session_end = $3,
                    updated_at = GREATEST(updated_at, $4)
                WHERE id = $1 AND status = 'active'
                "#,
            )
            .bind(enrollment_id)
            .bind(start)
            .bind(end)
            .bind(at)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "enrollment {} is no longer active",
                    enrollment_id
                )));
            }
        }
        Mutation::UpsertEducatorProfile(profile) => {
            sqlx::query(
                r#"
                INSERT INTO educator_profiles
                    (user_id, first_name, last_name, image_url, source_timestamp, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (user_id) DO UPDATE
                SET first_name = EXCLUDED.first_name,
                    last_name = EXCLUDED.last_name,
                    image_url = EXCLUDED.image_url,
                    source_timestamp = EXCLUDED.source_timestamp,
                    updated_at = NOW()
                WHERE educator_profiles.source_timestamp < EXCLUDED.source_timestamp
                "#,
            )
            .bind(&profile.user_id)
            .bind(&profile.first_name)
            .bind(&profile.last_name)
            .bind(&profile.image_url)
            .bind(profile.source_timestamp)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    record: &OutboxRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO events_outbox (event_id, subject, envelope)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(record.event_id)
    .bind(&record.subject)
    .bind(&record.envelope)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl EnrollmentStore for PgEnrollmentStore {
    async fn insert_enrollment(&self, new: NewEnrollment) -> StoreResult<Enrollment> {
        let row: EnrollmentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO enrollments (id, user_id, product_id, scheduled_event_id, status)
            VALUES ($1, $2, $3, $4, 'active')
            RETURNING {}
            "#,
            ENROLLMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new.user_id)
        .bind(new.product_id)
        .bind(new.scheduled_event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists(
                format!(
                    "active enrollment for {} on product {}",
                    new.user_id, new.product_id
                ),
            ),
            other => StoreError::Database(other),
        })?;

        row.try_into()
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        let row: Option<EnrollmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM enrollments WHERE id = $1",
            ENROLLMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Enrollment::try_from).transpose()
    }

    async fn find_enrollments(
        &self,
        user_id: &str,
        product_id: i64,
        scheduled_event_id: Option<i64>,
    ) -> StoreResult<Vec<Enrollment>> {
        let rows: Vec<EnrollmentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM enrollments
            WHERE user_id = $1
              AND product_id = $2
              AND ($3::BIGINT IS NULL OR scheduled_event_id = $3)
            ORDER BY created_at ASC
            "#,
            ENROLLMENT_COLUMNS
        ))
        .bind(user_id)
        .bind(product_id)
        .bind(scheduled_event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Enrollment::try_from).collect()
    }

    async fn get_educator_profile(&self, user_id: &str) -> StoreResult<Option<EducatorProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT user_id, first_name, last_name, image_url, source_timestamp
            FROM educator_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| EducatorProfile {
            user_id: r.user_id,
            first_name: r.first_name,
            last_name: r.last_name,
            image_url: r.image_url,
            source_timestamp: r.source_timestamp,
        }))
    }

    async fn is_processed(&self, event_id: Uuid) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(entry) = &unit.ledger {
            if !insert_ledger(&mut tx, entry).await? {
                tx.rollback().await?;
                return Ok(CommitOutcome::Duplicate);
            }
        }

        for mutation in &unit.mutations {
            // Dropping the transaction on error rolls it back
            apply_mutation(&mut tx, mutation).await?;
        }

        for record in &unit.outbox {
            insert_outbox(&mut tx, record).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            ledger = unit.ledger.is_some(),
            mutations = unit.mutations.len(),
            outbox = unit.outbox.len(),
            "Unit of work committed"
        );

        Ok(CommitOutcome::Applied)
    }

    async fn claim_pending_outbox(
        &self,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<PendingOutbox>> {
        // SKIP LOCKED keeps concurrent relays off each other's rows
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            UPDATE events_outbox
            SET status = 'publishing', claimed_at = NOW()
            WHERE id IN (
                SELECT id
                FROM events_outbox
                WHERE status = 'pending'
                   OR (status = 'publishing' AND claimed_at < NOW() - make_interval(secs => $2))
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, subject, envelope, retry_count
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<PendingOutbox> = rows
            .into_iter()
            .map(|r| PendingOutbox {
                id: r.id,
                event_id: r.event_id,
                subject: r.subject,
                envelope: r.envelope,
                retry_count: r.retry_count,
            })
            .collect();
        // RETURNING does not preserve the subquery order
        claimed.sort_by_key(|row| row.id);

        Ok(claimed)
    }

    async fn mark_outbox_published(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = 'published', published_at = NOW(), claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, error: &str, max_retries: i32) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET retry_count = retry_count + 1,
                last_error = $2,
                claimed_at = NULL,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END
            WHERE id = $1 AND status = 'publishing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_processed(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
