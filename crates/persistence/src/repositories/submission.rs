//! Registry submission repository.
//!
//! Every write touches exactly one row, so each operation is atomic per record.
//! Updates are compare-and-set on status and attempt count. Terminal rows
//! (VERIFIED, FAILED) are never updated.

use chrono::{DateTime, Utc};
use domain::models::submission::success_rate;
use domain::models::{
    DeviceSubmissionSummary, NewSubmission, SubmissionFilter, SubmissionRecord, SubmissionStats,
    SubmissionStatus, SubmissionUpdate, UpdateGuard,
};
use domain::services::SubmissionStore;
use domain::StoreError;
use shared::pagination::{Cursor, Page};
use sqlx::PgPool;
use uuid::Uuid;

use super::store_error;
use crate::entities::submission::SUBMISSION_COLUMNS;
use crate::entities::{DeviceSummaryRow, SubmissionEntity, SubmissionStatsRow};
use crate::metrics::QueryTimer;

/// Repository for registry submission records.
#[derive(Clone)]
pub struct SubmissionRepository {
    pool: PgPool,
}

impl SubmissionRepository {
    /// Create a new repository instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a PENDING row. Fails with a unique violation if a current row exists.
    pub async fn insert(&self, new: &NewSubmission) -> Result<SubmissionEntity, sqlx::Error> {
        let timer = QueryTimer::new("insert_submission");
        let sql = format!(
            r#"
            INSERT INTO registry_submissions (
                device_id, policy_id, period_start, period_end, total_energy_kwh,
                data_points_count, verification_hash, status, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', $8)
            RETURNING {}
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(&new.device_id)
            .bind(&new.policy_id)
            .bind(new.period_start)
            .bind(new.period_end)
            .bind(new.total_energy_kwh)
            .bind(new.data_points_count)
            .bind(&new.verification_hash)
            .bind(&new.payload)
            .fetch_one(&self.pool)
            .await;
        timer.record();
        result
    }

    /// Apply a partial update to a row that is still in the guarded state.
    ///
    /// Returns `None` when the row does not exist, is terminal or no longer matches `guard`.
    pub async fn update_guarded(
        &self,
        submission_id: Uuid,
        guard: &UpdateGuard,
        update: &SubmissionUpdate,
    ) -> Result<Option<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("update_submission");
        let sql = format!(
            r#"
            UPDATE registry_submissions
            SET status = COALESCE($2, status),
                registry_document_id = COALESCE($3, registry_document_id),
                registry_response = COALESCE($4, registry_response),
                retry_count = COALESCE($5, retry_count),
                error_message = COALESCE($6, error_message),
                last_error_class = COALESCE($7, last_error_class),
                submitted_at = COALESCE($8, submitted_at),
                verified_at = COALESCE($9, verified_at),
                updated_at = NOW()
            WHERE submission_id = $1
              AND status NOT IN ('VERIFIED', 'FAILED')
              AND status = $10
              AND ($11::INT IS NULL OR retry_count = $11)
            RETURNING {}
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(submission_id)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.registry_document_id.as_deref())
            .bind(update.registry_response.as_ref())
            .bind(update.retry_count)
            .bind(update.error_message.as_deref())
            .bind(update.last_error_class.map(|c| c.as_str()))
            .bind(update.submitted_at)
            .bind(update.verified_at)
            .bind(guard.status.as_str())
            .bind(guard.retry_count)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        result
    }

    pub async fn find_by_submission_id(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_submission_by_id");
        let sql = format!(
            "SELECT {} FROM registry_submissions WHERE submission_id = $1",
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        result
    }

    pub async fn find_by_document_id(
        &self,
        document_id: &str,
    ) -> Result<Option<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_submission_by_document_id");
        let sql = format!(
            r#"
            SELECT {} FROM registry_submissions
            WHERE registry_document_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        result
    }

    /// The current (non-FAILED) row for a device, period and hash.
    pub async fn find_current(
        &self,
        device_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        verification_hash: &str,
    ) -> Result<Option<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_current_submission");
        let sql = format!(
            r#"
            SELECT {} FROM registry_submissions
            WHERE device_id = $1
              AND period_start = $2
              AND period_end = $3
              AND verification_hash = $4
              AND status <> 'FAILED'
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(device_id)
            .bind(period_start)
            .bind(period_end)
            .bind(verification_hash)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        result
    }

    /// Filtered listing, newest first, keyset-paginated on `(created_at, id)`.
    pub async fn find_filtered(
        &self,
        filter: &SubmissionFilter,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> Result<Vec<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("list_submissions");
        let sql = format!(
            r#"
            SELECT {} FROM registry_submissions
            WHERE ($1::text IS NULL OR device_id = $1)
              AND ($2::text IS NULL OR policy_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR period_start >= $4)
              AND ($5::timestamptz IS NULL OR period_end <= $5)
              AND ($6::timestamptz IS NULL OR (created_at, id) < ($6, $7))
            ORDER BY created_at DESC, id DESC
            LIMIT $8
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(filter.device_id.as_deref())
            .bind(filter.policy_id.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.period_from)
            .bind(filter.period_to)
            .bind(cursor.map(|c| c.created_at))
            .bind(cursor.map(|c| c.id).unwrap_or(i64::MAX))
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();
        result
    }

    /// Rows in one status, oldest first.
    pub async fn find_by_status(
        &self,
        status: SubmissionStatus,
        limit: i64,
    ) -> Result<Vec<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_submissions_by_status");
        let sql = format!(
            r#"
            SELECT {} FROM registry_submissions
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();
        result
    }

    /// FAILED rows created since `since` whose last error class is retryable.
    pub async fn find_retryable_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SubmissionEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_retryable_failed_submissions");
        let sql = format!(
            r#"
            SELECT {} FROM registry_submissions
            WHERE status = 'FAILED'
              AND last_error_class IN ('transient', 'rate_limited')
              AND created_at >= $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            SUBMISSION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubmissionEntity>(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();
        result
    }

    pub async fn stats_row(&self) -> Result<SubmissionStatsRow, sqlx::Error> {
        let timer = QueryTimer::new("submission_stats");
        let result = sqlx::query_as::<_, SubmissionStatsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing,
                COUNT(*) FILTER (WHERE status = 'VERIFIED') AS verified,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                COALESCE(SUM(total_energy_kwh) FILTER (WHERE status = 'VERIFIED'), 0)::float8
                    AS total_verified_energy_kwh,
                (AVG(EXTRACT(EPOCH FROM (verified_at - submitted_at)))
                    FILTER (WHERE status = 'VERIFIED'
                              AND verified_at IS NOT NULL
                              AND submitted_at IS NOT NULL) / 3600.0)::float8
                    AS avg_verification_hours
            FROM registry_submissions
            "#,
        )
        .fetch_one(&self.pool)
        .await;
        timer.record();
        result
    }

    pub async fn device_summary_row(
        &self,
        device_id: &str,
    ) -> Result<DeviceSummaryRow, sqlx::Error> {
        let timer = QueryTimer::new("device_submission_summary");
        let result = sqlx::query_as::<_, DeviceSummaryRow>(
            r#"
            SELECT
                COUNT(*) AS total_submissions,
                COUNT(*) FILTER (WHERE status = 'VERIFIED') AS verified,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                COUNT(*) FILTER (WHERE status IN ('PENDING', 'PROCESSING')) AS in_flight,
                COALESCE(SUM(total_energy_kwh) FILTER (WHERE status = 'VERIFIED'), 0)::float8
                    AS total_verified_energy_kwh,
                MAX(created_at) AS last_submission_at
            FROM registry_submissions
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Delete rows created before `cutoff`.
    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let timer = QueryTimer::new("delete_old_submissions");
        let result = sqlx::query(
            r#"
            DELETE FROM registry_submissions
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await;
        timer.record();
        Ok(result?.rows_affected())
    }
}

fn to_records(entities: Vec<SubmissionEntity>) -> Result<Vec<SubmissionRecord>, StoreError> {
    entities.into_iter().map(SubmissionRecord::try_from).collect()
}

#[async_trait::async_trait]
impl SubmissionStore for SubmissionRepository {
    async fn create(&self, new: NewSubmission) -> Result<SubmissionRecord, StoreError> {
        self.insert(&new)
            .await
            .map_err(store_error)?
            .try_into()
    }

    async fn update(
        &self,
        submission_id: Uuid,
        guard: UpdateGuard,
        update: SubmissionUpdate,
    ) -> Result<SubmissionRecord, StoreError> {
        update.check_transition(guard.status)?;
        match self
            .update_guarded(submission_id, &guard, &update)
            .await
            .map_err(store_error)?
        {
            Some(entity) => entity.try_into(),
            None => {
                let current = self
                    .find_by_submission_id(submission_id)
                    .await
                    .map_err(store_error)?
                    .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))?;
                let record = SubmissionRecord::try_from(current)?;
                guard.check(&record, &update)?;
                // Matched on re-read: the row moved and came back between the two queries.
                Err(StoreError::Conflict(submission_id))
            }
        }
    }

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError> {
        self.find_by_submission_id(submission_id)
            .await
            .map_err(store_error)?
            .map(SubmissionRecord::try_from)
            .transpose()
    }

    async fn get_by_document_id(
        &self,
        document_id: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        self.find_by_document_id(document_id)
            .await
            .map_err(store_error)?
            .map(SubmissionRecord::try_from)
            .transpose()
    }

    async fn find_by(
        &self,
        device_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        verification_hash: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        self.find_current(device_id, period_start, period_end, verification_hash)
            .await
            .map_err(store_error)?
            .map(SubmissionRecord::try_from)
            .transpose()
    }

    async fn list(
        &self,
        filter: &SubmissionFilter,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> Result<Page<SubmissionRecord>, StoreError> {
        let rows = self
            .find_filtered(filter, cursor, limit + 1)
            .await
            .map_err(store_error)?;
        Ok(Page::from_overfetch(to_records(rows)?, limit, |r| {
            Cursor::new(r.created_at, r.id)
        }))
    }

    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        to_records(
            self.find_by_status(status, limit)
                .await
                .map_err(store_error)?,
        )
    }

    async fn list_retryable_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        to_records(
            self.find_retryable_failures(since, limit)
                .await
                .map_err(store_error)?,
        )
    }

    async fn stats(&self) -> Result<SubmissionStats, StoreError> {
        let row = self.stats_row().await.map_err(store_error)?;
        Ok(SubmissionStats {
            total: row.total,
            pending: row.pending,
            processing: row.processing,
            verified: row.verified,
            failed: row.failed,
            total_verified_energy_kwh: row.total_verified_energy_kwh,
            success_rate_percent: success_rate(row.verified, row.failed),
            avg_verification_hours: row.avg_verification_hours,
        })
    }

    async fn device_summary(
        &self,
        device_id: &str,
    ) -> Result<DeviceSubmissionSummary, StoreError> {
        let row = self
            .device_summary_row(device_id)
            .await
            .map_err(store_error)?;
        Ok(DeviceSubmissionSummary {
            device_id: device_id.to_string(),
            total_submissions: row.total_submissions,
            verified: row.verified,
            failed: row.failed,
            in_flight: row.in_flight,
            total_verified_energy_kwh: row.total_verified_energy_kwh,
            last_submission_at: row.last_submission_at,
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.delete_created_before(cutoff)
            .await
            .map_err(store_error)
    }
}
