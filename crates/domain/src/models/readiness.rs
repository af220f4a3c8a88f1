//! Registry readiness evaluation model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHECK_DATA_COMPLETENESS: &str = "data_completeness";
pub const CHECK_DATA_INTEGRITY: &str = "data_integrity";
pub const CHECK_SUFFICIENT_READINGS: &str = "sufficient_readings";
pub const CHECK_ENERGY_PRODUCTION: &str = "energy_production";

/// Minimum quality a report must meet before it is worth submitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessThresholds {
    pub min_completeness_percent: f64,
    pub min_integrity_score: f64,
    pub min_readings: u32,
    pub min_energy_kwh: f64,
}

impl Default for ReadinessThresholds {
    fn default() -> Self {
        Self {
            min_completeness_percent: 80.0,
            min_integrity_score: 0.7,
            min_readings: 100,
            min_energy_kwh: 0.1,
        }
    }
}

/// Outcome of one named threshold check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
}

impl ReadinessCheck {
    /// Passes when `value >= threshold`.
    pub fn at_least(value: f64, threshold: f64) -> Self {
        Self {
            value,
            threshold,
            passed: value >= threshold,
        }
    }
}

/// Structured readiness verdict for a (device, period).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessResult {
    pub device_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(rename = "guardian_ready")]
    pub registry_ready: bool,
    pub checks: BTreeMap<String, ReadinessCheck>,
    pub summary: String,
    /// Set when aggregation itself could not produce a report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResult {
    pub fn check(&self, name: &str) -> Option<&ReadinessCheck> {
        self.checks.get(name)
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, c)| !c.passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
