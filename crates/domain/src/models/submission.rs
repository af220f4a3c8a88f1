//! Registry submission record and its state machine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::reading::DEVICE_ID_REGEX;
use super::report::AggregatedEnergyReport;
use crate::error::StoreError;

/// Lifecycle of one registry submission.
///
/// `PENDING → PROCESSING → VERIFIED`, with `FAILED` reachable from either
/// non-terminal state. `VERIFIED` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Verified,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Processing => "PROCESSING",
            SubmissionStatus::Verified => "VERIFIED",
            SubmissionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Verified | SubmissionStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Verified) | (Processing, Failed)
        )
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SubmissionStatus::Pending),
            "PROCESSING" => Ok(SubmissionStatus::Processing),
            "VERIFIED" => Ok(SubmissionStatus::Verified),
            "FAILED" => Ok(SubmissionStatus::Failed),
            other => Err(format!("unknown submission status: {}", other)),
        }
    }
}

/// Classification of a registry failure. Decides whether the retry loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport errors, timeouts, 5xx.
    Transient,
    /// Registry rejected the document contents.
    Validation,
    /// Credentials missing, expired beyond refresh, or not permitted.
    Authentication,
    /// 429 with an optional retry-after hint.
    RateLimited,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Authentication => "authentication",
            ErrorClass::RateLimited => "rate_limited",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimited)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "validation" => Ok(ErrorClass::Validation),
            "authentication" => Ok(ErrorClass::Authentication),
            "rate_limited" => Ok(ErrorClass::RateLimited),
            other => Err(format!("unknown error class: {}", other)),
        }
    }
}

/// Durable record tracking one report's delivery to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubmissionRecord {
    /// Storage row id, used for stable pagination.
    pub id: i64,
    pub submission_id: Uuid,
    pub device_id: String,
    pub policy_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_energy_kwh: f64,
    pub data_points_count: i32,
    pub verification_hash: String,
    pub status: SubmissionStatus,
    pub registry_document_id: Option<String>,
    /// Document body sent to the registry; kept so a restarted process can resume.
    pub payload: serde_json::Value,
    pub registry_response: Option<serde_json::Value>,
    /// Create-document attempts made so far.
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    /// Failed, but only because retries ran out; a later run may succeed as-is.
    pub fn may_retry_later(&self) -> bool {
        self.status == SubmissionStatus::Failed
            && self
                .last_error_class
                .map(|c| c.is_retryable())
                .unwrap_or(false)
    }

    /// Applies a partial update in place. Callers check transition legality first.
    pub fn apply(&mut self, update: &SubmissionUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(ref doc_id) = update.registry_document_id {
            self.registry_document_id = Some(doc_id.clone());
        }
        if let Some(ref response) = update.registry_response {
            self.registry_response = Some(response.clone());
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(ref message) = update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(class) = update.last_error_class {
            self.last_error_class = Some(class);
        }
        if let Some(at) = update.submitted_at {
            self.submitted_at = Some(at);
        }
        if let Some(at) = update.verified_at {
            self.verified_at = Some(at);
        }
        self.updated_at = now;
    }
}

/// Fields needed to create a submission record in `PENDING`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub device_id: String,
    pub policy_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_energy_kwh: f64,
    pub data_points_count: i32,
    pub verification_hash: String,
    pub payload: serde_json::Value,
}

impl NewSubmission {
    /// Copies identity and hash from the report; the hash is never recomputed later.
    pub fn from_report(
        report: &AggregatedEnergyReport,
        policy_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: report.device_id.clone(),
            policy_id: policy_id.to_string(),
            period_start: report.period_start,
            period_end: report.period_end,
            total_energy_kwh: report.energy_metrics.total_energy_kwh,
            data_points_count: report.data_quality.valid_readings as i32,
            verification_hash: report.verification_hash.clone(),
            payload,
        }
    }

    /// A fresh attempt for a previously failed record.
    pub fn from_failed(record: &SubmissionRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            policy_id: record.policy_id.clone(),
            period_start: record.period_start,
            period_end: record.period_end,
            total_energy_kwh: record.total_energy_kwh,
            data_points_count: record.data_points_count,
            verification_hash: record.verification_hash.clone(),
            payload: record.payload.clone(),
        }
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionUpdate {
    pub status: Option<SubmissionStatus>,
    pub registry_document_id: Option<String>,
    pub registry_response: Option<serde_json::Value>,
    pub retry_count: Option<i32>,
    pub error_message: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl SubmissionUpdate {
    /// Checks that this update is a legal step for a record currently in `from`.
    ///
    /// Status changes must follow the state machine, `verified_at` is set exactly
    /// when moving to VERIFIED and `error_message` only when moving to FAILED.
    pub fn check_transition(&self, from: SubmissionStatus) -> Result<(), StoreError> {
        if let Some(next) = self.status {
            if !from.can_transition_to(next) {
                return Err(StoreError::InvalidTransition(format!("{} -> {}", from, next)));
            }
        }
        let to_verified = self.status == Some(SubmissionStatus::Verified);
        if to_verified != self.verified_at.is_some() {
            return Err(StoreError::InvalidTransition(
                "verified_at is set exactly when moving to VERIFIED".to_string(),
            ));
        }
        if self.error_message.is_some() && self.status != Some(SubmissionStatus::Failed) {
            return Err(StoreError::InvalidTransition(
                "error_message is only set when moving to FAILED".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the stored record must still look like for an update to apply.
///
/// Updates are compare-and-set: a record whose status or attempt count moved on
/// since the caller read it is reported as [`StoreError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateGuard {
    pub status: SubmissionStatus,
    pub retry_count: Option<i32>,
}

impl UpdateGuard {
    /// Expect the record to still be in `status`.
    pub fn status(status: SubmissionStatus) -> Self {
        Self {
            status,
            retry_count: None,
        }
    }

    /// Expect the record to be in `status` with exactly `retry_count` attempts claimed.
    pub fn attempt(status: SubmissionStatus, retry_count: i32) -> Self {
        Self {
            status,
            retry_count: Some(retry_count),
        }
    }

    /// Validate `update` against the stored `record` under this guard.
    pub fn check(
        &self,
        record: &SubmissionRecord,
        update: &SubmissionUpdate,
    ) -> Result<(), StoreError> {
        if record.status.is_terminal() {
            return Err(StoreError::Terminal(record.submission_id));
        }
        if record.status != self.status
            || self.retry_count.map_or(false, |n| n != record.retry_count)
        {
            return Err(StoreError::Conflict(record.submission_id));
        }
        update.check_transition(record.status)
    }
}

/// Filters for listing submissions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmissionFilter {
    pub device_id: Option<String>,
    pub policy_id: Option<String>,
    pub status: Option<SubmissionStatus>,
    pub period_from: Option<DateTime<Utc>>,
    pub period_to: Option<DateTime<Utc>>,
}

impl SubmissionFilter {
    pub fn matches(&self, record: &SubmissionRecord) -> bool {
        self.device_id
            .as_ref()
            .map_or(true, |d| &record.device_id == d)
            && self
                .policy_id
                .as_ref()
                .map_or(true, |p| &record.policy_id == p)
            && self.status.map_or(true, |s| record.status == s)
            && self.period_from.map_or(true, |from| record.period_start >= from)
            && self.period_to.map_or(true, |to| record.period_end <= to)
    }
}

/// Aggregate figures across all submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmissionStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub verified: i64,
    pub failed: i64,
    pub total_verified_energy_kwh: f64,
    /// verified / (verified + failed) × 100, or 0 when nothing has finished.
    pub success_rate_percent: f64,
    /// Mean hours from submission to verification.
    pub avg_verification_hours: Option<f64>,
}

/// Per-device submission history summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSubmissionSummary {
    pub device_id: String,
    pub total_submissions: i64,
    pub verified: i64,
    pub failed: i64,
    pub in_flight: i64,
    pub total_verified_energy_kwh: f64,
    pub last_submission_at: Option<DateTime<Utc>>,
}

/// Request payload for an on-demand submission.
///
/// The period is either one UTC `date`, an explicit `start`/`end`, or, when
/// neither is given, the previous UTC day.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSubmissionRequest {
    #[validate(regex(path = *DEVICE_ID_REGEX, message = "device_id is not a valid device identifier"))]
    pub device_id: String,

    #[validate(length(min = 1, max = 128, message = "policy_id must be 1-128 characters"))]
    pub policy_id: Option<String>,

    pub date: Option<NaiveDate>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Submission as shown in listings, without the stored payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionSummary {
    pub submission_id: Uuid,
    pub device_id: String,
    pub policy_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_energy_kwh: f64,
    pub status: SubmissionStatus,
    pub registry_document_id: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl From<&SubmissionRecord> for SubmissionSummary {
    fn from(r: &SubmissionRecord) -> Self {
        Self {
            submission_id: r.submission_id,
            device_id: r.device_id.clone(),
            policy_id: r.policy_id.clone(),
            period_start: r.period_start,
            period_end: r.period_end,
            total_energy_kwh: r.total_energy_kwh,
            status: r.status,
            registry_document_id: r.registry_document_id.clone(),
            retry_count: r.retry_count,
            error_message: r.error_message.clone(),
            created_at: r.created_at,
            verified_at: r.verified_at,
        }
    }
}

pub fn success_rate(verified: i64, failed: i64) -> f64 {
    let finished = verified + failed;
    if finished == 0 {
        0.0
    } else {
        verified as f64 / finished as f64 * 100.0
    }
}
