//! Telemetry ingestion endpoint.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use domain::models::{IngestReadingRequest, IngestReadingResponse, RawReading};
use metrics::counter;
use shared::validation::validate_reading_time;
use tracing::debug;
use validator::{Validate, ValidationErrors};

use crate::app::AppState;
use crate::error::ApiError;

/// Store one raw reading.
///
/// POST /api/v1/readings
///
/// Only structural validation happens here. Readings outside the electrical
/// bands are kept so that they count against data quality at aggregation time.
pub async fn ingest_reading(
    State(state): State<AppState>,
    Json(request): Json<IngestReadingRequest>,
) -> Result<(StatusCode, Json<IngestReadingResponse>), ApiError> {
    let mut errors = match request.validate() {
        Ok(()) => ValidationErrors::new(),
        Err(e) => e,
    };
    if let Err(e) = validate_reading_time(request.timestamp, Utc::now()) {
        errors.add("timestamp", e);
    }
    if !errors.errors().is_empty() {
        counter!("readings_rejected_total").increment(1);
        return Err(errors.into());
    }

    let reading = RawReading::from(request);
    let device_id = reading.device_id.clone();
    let timestamp = reading.timestamp;
    let id = state.readings.append(reading).await?;

    counter!("readings_ingested_total").increment(1);
    debug!(device_id = %device_id, id, "Reading stored");

    Ok((
        StatusCode::CREATED,
        Json(IngestReadingResponse {
            id,
            device_id,
            timestamp,
        }),
    ))
}
