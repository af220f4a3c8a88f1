//! Telemetry field validation utilities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::ValidationError;

/// Maximum allowed future timestamp tolerance in seconds (5 minutes for clock skew).
const MAX_FUTURE_TOLERANCE_SECS: i64 = 300;

/// Maximum age of an ingested reading in days.
const MAX_READING_AGE_DAYS: i64 = 30;

/// Inclusive numeric band `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Band of `nominal ± nominal × fraction`.
    pub fn around(nominal: f64, fraction: f64) -> Self {
        let delta = nominal * fraction;
        Self {
            min: nominal - delta,
            max: nominal + delta,
        }
    }

    /// True for finite values within the band. NaN and infinities never match.
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Validates that a reading timestamp is plausible relative to `now`.
/// - Must not be more than 5 minutes in the future (allows for clock skew)
/// - Must not be older than 30 days
pub fn validate_reading_time(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if timestamp > now + Duration::seconds(MAX_FUTURE_TOLERANCE_SECS) {
        let mut err = ValidationError::new("timestamp_future");
        err.message = Some("Timestamp cannot be in the future".into());
        return Err(err);
    }

    if timestamp < now - Duration::days(MAX_READING_AGE_DAYS) {
        let mut err = ValidationError::new("timestamp_old");
        err.message = Some("Timestamp cannot be older than 30 days".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that a measured value is a finite number.
pub fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        let mut err = ValidationError::new("not_finite");
        err.message = Some("Value must be a finite number".into());
        Err(err)
    }
}
