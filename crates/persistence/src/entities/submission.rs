//! Registry submission entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::{ErrorClass, SubmissionRecord, SubmissionStatus};
use domain::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the registry_submissions table.
#[derive(Debug, Clone, FromRow)]
pub struct SubmissionEntity {
    pub id: i64,
    pub submission_id: Uuid,
    pub device_id: String,
    pub policy_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_energy_kwh: f64,
    pub data_points_count: i32,
    pub verification_hash: String,
    pub status: String,
    pub registry_document_id: Option<String>,
    pub payload: serde_json::Value,
    pub registry_response: Option<serde_json::Value>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub last_error_class: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column list shared by every query that returns a [`SubmissionEntity`].
pub const SUBMISSION_COLUMNS: &str = "id, submission_id, device_id, policy_id, period_start, \
    period_end, total_energy_kwh, data_points_count, verification_hash, status, \
    registry_document_id, payload, registry_response, retry_count, error_message, \
    last_error_class, submitted_at, verified_at, created_at, updated_at";

impl TryFrom<SubmissionEntity> for SubmissionRecord {
    type Error = StoreError;

    fn try_from(entity: SubmissionEntity) -> Result<Self, Self::Error> {
        let status: SubmissionStatus = entity
            .status
            .parse()
            .map_err(StoreError::Corrupt)?;
        let last_error_class = entity
            .last_error_class
            .as_deref()
            .map(str::parse::<ErrorClass>)
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(Self {
            id: entity.id,
            submission_id: entity.submission_id,
            device_id: entity.device_id,
            policy_id: entity.policy_id,
            period_start: entity.period_start,
            period_end: entity.period_end,
            total_energy_kwh: entity.total_energy_kwh,
            data_points_count: entity.data_points_count,
            verification_hash: entity.verification_hash,
            status,
            registry_document_id: entity.registry_document_id,
            payload: entity.payload,
            registry_response: entity.registry_response,
            retry_count: entity.retry_count,
            error_message: entity.error_message,
            last_error_class,
            submitted_at: entity.submitted_at,
            verified_at: entity.verified_at,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        })
    }
}

/// Aggregate row for submission statistics.
#[derive(Debug, Clone, FromRow)]
pub struct SubmissionStatsRow {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub verified: i64,
    pub failed: i64,
    pub total_verified_energy_kwh: f64,
    pub avg_verification_hours: Option<f64>,
}

/// Aggregate row for a single device's submission history.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceSummaryRow {
    pub total_submissions: i64,
    pub verified: i64,
    pub failed: i64,
    pub in_flight: i64,
    pub total_verified_energy_kwh: f64,
    pub last_submission_at: Option<DateTime<Utc>>,
}
