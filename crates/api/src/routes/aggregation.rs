//! Aggregation and readiness endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use domain::models::{AggregatedEnergyReport, ReadinessResult, ReportingWindow};
use serde::Deserialize;

use crate::app::AppState;
use crate::error::ApiError;

/// Reporting window selection.
///
/// `date` selects one UTC day; `start` and `end` select an explicit half-open
/// window. With neither, the 24 hours ending now are used.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub date: Option<NaiveDate>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl WindowQuery {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<ReportingWindow, ApiError> {
        match (self.date, self.start, self.end) {
            (Some(date), None, None) => Ok(ReportingWindow::day(date)),
            (None, Some(start), Some(end)) => Ok(ReportingWindow::new(start, end)?),
            (None, None, None) => Ok(ReportingWindow::rolling_day(now)),
            (Some(_), _, _) => Err(ApiError::Validation(
                "date cannot be combined with start or end".to_string(),
            )),
            _ => Err(ApiError::Validation(
                "start and end must be given together".to_string(),
            )),
        }
    }
}

/// Aggregate a device's readings over a window.
///
/// GET /api/v1/devices/:device_id/aggregate
pub async fn aggregate_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<AggregatedEnergyReport>, ApiError> {
    let window = query.resolve(Utc::now())?;
    let report = state.aggregator.aggregate_window(&device_id, &window).await?;
    Ok(Json(report))
}

/// Evaluate registry readiness without submitting anything.
///
/// GET /api/v1/devices/:device_id/readiness
pub async fn device_readiness(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ReadinessResult>, ApiError> {
    let window = query.resolve(Utc::now())?;
    let readiness = state
        .aggregator
        .validate_registry_readiness(&device_id, &window)
        .await?;
    Ok(Json(readiness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_date_selects_utc_day() {
        let query = WindowQuery {
            date: NaiveDate::from_ymd_opt(2025, 6, 1),
            ..Default::default()
        };
        let window = query.resolve(now()).unwrap();
        assert_eq!(window.start(), Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end(), Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_default_is_rolling_day() {
        let window = WindowQuery::default().resolve(now()).unwrap();
        assert_eq!(window.end(), now());
        assert_eq!(window.start(), now() - Duration::hours(24));
    }

    #[test]
    fn test_explicit_window() {
        let query = WindowQuery {
            start: Some(now() - Duration::hours(6)),
            end: Some(now()),
            ..Default::default()
        };
        let window = query.resolve(now()).unwrap();
        assert_eq!(window.end() - window.start(), Duration::hours(6));
    }

    #[test]
    fn test_invalid_combinations() {
        let half_open = WindowQuery {
            start: Some(now()),
            ..Default::default()
        };
        assert!(matches!(half_open.resolve(now()), Err(ApiError::Validation(_))));

        let mixed = WindowQuery {
            date: NaiveDate::from_ymd_opt(2025, 6, 1),
            end: Some(now()),
            ..Default::default()
        };
        assert!(matches!(mixed.resolve(now()), Err(ApiError::Validation(_))));

        let inverted = WindowQuery {
            start: Some(now()),
            end: Some(now() - Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(inverted.resolve(now()), Err(ApiError::Validation(_))));
    }
}
