//! Registry submission endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use domain::models::{
    CreateSubmissionRequest, DeviceSubmissionSummary, ReportingWindow, SubmissionFilter,
    SubmissionRecord, SubmissionStats, SubmissionStatus, SubmissionSummary,
};
use domain::services::evaluate_readiness;
use serde::Deserialize;
use shared::pagination::{clamp_limit, Cursor, Page};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::aggregation::WindowQuery;
use crate::app::AppState;
use crate::error::ApiError;

/// Aggregate, check readiness, and submit one report.
///
/// POST /api/v1/submissions
///
/// Returns 201 for a new submission and 200 when an identical report is already
/// submitted. Reports that fail readiness are refused with 422.
pub async fn create_submission(
    State(state): State<AppState>,
    Json(request): Json<CreateSubmissionRequest>,
) -> Result<(StatusCode, Json<SubmissionRecord>), ApiError> {
    request.validate()?;

    let now = Utc::now();
    let window = if request.date.is_none() && request.start.is_none() && request.end.is_none() {
        ReportingWindow::day((now - Duration::days(1)).date_naive())
    } else {
        WindowQuery {
            date: request.date,
            start: request.start,
            end: request.end,
        }
        .resolve(now)?
    };

    let policy_id = request
        .policy_id
        .as_deref()
        .unwrap_or(state.config.scheduler.default_policy_id.as_str())
        .trim()
        .to_string();
    if policy_id.is_empty() {
        return Err(ApiError::Validation(
            "policy_id is required when no default policy is configured".to_string(),
        ));
    }

    let report = state
        .aggregator
        .aggregate_window(&request.device_id, &window)
        .await?;

    let readiness = evaluate_readiness(&report, state.aggregator.thresholds());
    if !readiness.registry_ready {
        return Err(ApiError::Unprocessable(format!(
            "{}; failed checks: {}",
            readiness.summary,
            readiness.failed_checks().join(", ")
        )));
    }

    let existing = state
        .pipeline
        .store()
        .find_by(
            &report.device_id,
            report.period_start,
            report.period_end,
            &report.verification_hash,
        )
        .await?;

    let record = state.pipeline.submit_report(&report, &policy_id).await?;
    info!(
        submission_id = %record.submission_id,
        device_id = %record.device_id,
        status = %record.status,
        "Submission requested"
    );

    let status = if existing.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSubmissionsQuery {
    pub device_id: Option<String>,
    pub policy_id: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

impl ListSubmissionsQuery {
    fn filter(&self) -> Result<SubmissionFilter, ApiError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<SubmissionStatus>)
            .transpose()
            .map_err(ApiError::Validation)?;
        Ok(SubmissionFilter {
            device_id: self.device_id.clone(),
            policy_id: self.policy_id.clone(),
            status,
            period_from: self.from,
            period_to: self.to,
        })
    }
}

/// List submissions, newest first.
///
/// GET /api/v1/submissions
pub async fn list_submissions(
    State(state): State<AppState>,
    Query(query): Query<ListSubmissionsQuery>,
) -> Result<Json<Page<SubmissionSummary>>, ApiError> {
    let filter = query.filter()?;
    let cursor = query.cursor.as_deref().map(Cursor::decode).transpose()?;
    let limit = clamp_limit(query.limit);

    let page = state.pipeline.store().list(&filter, cursor, limit).await?;
    Ok(Json(Page {
        items: page.items.iter().map(SubmissionSummary::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

/// GET /api/v1/submissions/stats
pub async fn submission_stats(
    State(state): State<AppState>,
) -> Result<Json<SubmissionStats>, ApiError> {
    Ok(Json(state.pipeline.store().stats().await?))
}

/// GET /api/v1/submissions/:submission_id
pub async fn get_submission(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> Result<Json<SubmissionRecord>, ApiError> {
    state
        .pipeline
        .store()
        .get(submission_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Submission {} not found", submission_id)))
}

/// Poll the registry once for a submission's verification status.
///
/// POST /api/v1/submissions/:submission_id/track
pub async fn track_submission(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> Result<Json<SubmissionRecord>, ApiError> {
    let record = state
        .pipeline
        .track_submission_progress(submission_id)
        .await?;
    Ok(Json(record))
}

/// GET /api/v1/devices/:device_id/submissions/summary
pub async fn device_summary(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceSubmissionSummary>, ApiError> {
    Ok(Json(state.pipeline.store().device_summary(&device_id).await?))
}
