//! Aggregated energy report model.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

/// Half-open reporting window `[start, end)` with `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportingWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ReportingWindow {
    /// Create a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AggregationError> {
        if end <= start {
            return Err(AggregationError::InvalidArgument(format!(
                "period end {} must be after period start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The UTC calendar day `[date 00:00, date+1 00:00)`.
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// The 24 hours ending at `now`.
    pub fn rolling_day(now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::hours(24),
            end: now,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    /// Window length in hours.
    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Energy production figures for the period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyMetrics {
    pub total_energy_kwh: f64,
    pub avg_power_w: f64,
    pub max_power_w: f64,
    pub min_power_w: f64,
    pub peak_to_avg_ratio: f64,
    pub capacity_factor: f64,
}

/// Conversion performance figures for the period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub avg_efficiency: f64,
    pub max_efficiency: f64,
    pub min_efficiency: f64,
    pub avg_power_factor: f64,
    pub avg_grid_frequency_hz: f64,
}

/// Ambient conditions during the period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalMetrics {
    pub avg_irradiance_w_m2: f64,
    pub max_irradiance_w_m2: f64,
    pub avg_temperature_c: f64,
    pub max_temperature_c: f64,
    pub min_temperature_c: f64,
}

/// How much of the raw data survived cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityMetrics {
    pub total_readings: u32,
    pub valid_readings: u32,
    pub missing_readings: u32,
    pub data_completeness_percent: f64,
    pub outlier_count: u32,
    pub measurement_period_hours: f64,
}

/// Static grid and measurement metadata attached to every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalCompliance {
    pub region: String,
    pub grid_standard: String,
    pub nominal_voltage_v: f64,
    pub nominal_frequency_hz: f64,
    pub voltage_tolerance_percent: f64,
    pub frequency_tolerance_percent: f64,
    pub measurement_standard: String,
    pub timezone: String,
}

impl Default for RegionalCompliance {
    fn default() -> Self {
        Self {
            region: "Morocco".to_string(),
            grid_standard: "220V_50Hz".to_string(),
            nominal_voltage_v: 220.0,
            nominal_frequency_hz: 50.0,
            voltage_tolerance_percent: 10.0,
            frequency_tolerance_percent: 2.0,
            measurement_standard: "IEC_61724".to_string(),
            timezone: "Africa/Casablanca".to_string(),
        }
    }
}

/// Immutable result of one aggregation run for a (device, period) pair.
///
/// Only the aggregator constructs these, so the period is always well-formed and
/// the verification hash always matches the cleaned data it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEnergyReport {
    pub device_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub energy_metrics: EnergyMetrics,
    pub performance_metrics: PerformanceMetrics,
    pub environmental_metrics: EnvironmentalMetrics,
    pub data_quality: DataQualityMetrics,
    pub verification_hash: String,
    pub data_integrity_score: f64,
    pub regional_compliance: RegionalCompliance,
}

impl AggregatedEnergyReport {
    pub fn period_hours(&self) -> f64 {
        (self.period_end - self.period_start).num_milliseconds() as f64 / 3_600_000.0
    }
}
