//! Registry document built from an aggregated report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{AggregatedEnergyReport, RegionalCompliance};

pub const DOCUMENT_TYPE: &str = "renewable_energy_production";
pub const DOCUMENT_SOURCE: &str = "VerifiedCC_ESP32_Network";
pub const DOCUMENT_VERSION: &str = "1.0";

/// Request body for the registry's block submission endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryDocumentRequest {
    pub document: RegistryDocument,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryDocument {
    #[serde(rename = "type")]
    pub document_type: &'static str,
    pub device_id: String,
    pub reporting_period: ReportingPeriod,
    pub energy_production: EnergyProduction,
    pub performance_metrics: Performance,
    pub environmental_conditions: EnvironmentalConditions,
    pub data_quality: DataQuality,
    pub regional_compliance: RegionalCompliance,
    pub verification: Verification,
    pub source: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyProduction {
    pub total_kwh: f64,
    pub average_power_w: f64,
    pub peak_power_w: f64,
    pub min_power_w: f64,
    pub peak_to_average_ratio: f64,
    pub capacity_factor: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub average_efficiency: f64,
    pub max_efficiency: f64,
    pub min_efficiency: f64,
    pub average_power_factor: f64,
    pub grid_frequency_hz: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentalConditions {
    pub average_irradiance_w_m2: f64,
    pub peak_irradiance_w_m2: f64,
    pub average_temperature_c: f64,
    pub temperature_range: TemperatureRange,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataQuality {
    pub total_readings: u32,
    pub valid_readings: u32,
    pub outlier_count: u32,
    pub data_completeness_percent: f64,
    pub measurement_period_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub hash: String,
    pub data_integrity_score: f64,
}

impl From<&AggregatedEnergyReport> for RegistryDocument {
    fn from(report: &AggregatedEnergyReport) -> Self {
        let energy = &report.energy_metrics;
        let perf = &report.performance_metrics;
        let env = &report.environmental_metrics;
        let quality = &report.data_quality;

        Self {
            document_type: DOCUMENT_TYPE,
            device_id: report.device_id.clone(),
            reporting_period: ReportingPeriod {
                start: report.period_start,
                end: report.period_end,
                duration_hours: report.period_hours(),
            },
            energy_production: EnergyProduction {
                total_kwh: energy.total_energy_kwh,
                average_power_w: energy.avg_power_w,
                peak_power_w: energy.max_power_w,
                min_power_w: energy.min_power_w,
                peak_to_average_ratio: energy.peak_to_avg_ratio,
                capacity_factor: energy.capacity_factor,
            },
            performance_metrics: Performance {
                average_efficiency: perf.avg_efficiency,
                max_efficiency: perf.max_efficiency,
                min_efficiency: perf.min_efficiency,
                average_power_factor: perf.avg_power_factor,
                grid_frequency_hz: perf.avg_grid_frequency_hz,
            },
            environmental_conditions: EnvironmentalConditions {
                average_irradiance_w_m2: env.avg_irradiance_w_m2,
                peak_irradiance_w_m2: env.max_irradiance_w_m2,
                average_temperature_c: env.avg_temperature_c,
                temperature_range: TemperatureRange {
                    min: env.min_temperature_c,
                    max: env.max_temperature_c,
                },
            },
            data_quality: DataQuality {
                total_readings: quality.total_readings,
                valid_readings: quality.valid_readings,
                outlier_count: quality.outlier_count,
                data_completeness_percent: quality.data_completeness_percent,
                measurement_period_hours: quality.measurement_period_hours,
            },
            regional_compliance: report.regional_compliance.clone(),
            verification: Verification {
                hash: report.verification_hash.clone(),
                data_integrity_score: report.data_integrity_score,
            },
            source: DOCUMENT_SOURCE,
            version: DOCUMENT_VERSION,
        }
    }
}

/// Serialize a report into the JSON body sent to the registry.
pub fn build_payload(report: &AggregatedEnergyReport) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(RegistryDocumentRequest {
        document: RegistryDocument::from(report),
        reference: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DataQualityMetrics, EnergyMetrics, EnvironmentalMetrics, PerformanceMetrics,
    };
    use chrono::{Duration, TimeZone};

    fn sample_report() -> AggregatedEnergyReport {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        AggregatedEnergyReport {
            device_id: "ESP32_001".into(),
            period_start: start,
            period_end: start + Duration::days(1),
            energy_metrics: EnergyMetrics {
                total_energy_kwh: 12.5,
                avg_power_w: 520.0,
                max_power_w: 2100.0,
                min_power_w: 0.0,
                peak_to_avg_ratio: 4.04,
                capacity_factor: 0.104,
            },
            performance_metrics: PerformanceMetrics {
                avg_efficiency: 0.95,
                max_efficiency: 0.97,
                min_efficiency: 0.91,
                avg_power_factor: 0.98,
                avg_grid_frequency_hz: 50.01,
            },
            environmental_metrics: EnvironmentalMetrics {
                avg_irradiance_w_m2: 420.0,
                max_irradiance_w_m2: 980.0,
                avg_temperature_c: 27.0,
                max_temperature_c: 34.0,
                min_temperature_c: 18.0,
            },
            data_quality: DataQualityMetrics {
                total_readings: 1440,
                valid_readings: 1430,
                missing_readings: 10,
                data_completeness_percent: 99.3,
                outlier_count: 10,
                measurement_period_hours: 24.0,
            },
            verification_hash: "ab".repeat(32),
            data_integrity_score: 0.99,
            regional_compliance: RegionalCompliance::default(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = build_payload(&sample_report()).unwrap();
        let doc = &payload["document"];

        assert!(payload["ref"].is_null());
        assert_eq!(doc["type"], DOCUMENT_TYPE);
        assert_eq!(doc["device_id"], "ESP32_001");
        assert_eq!(doc["reporting_period"]["duration_hours"], 24.0);
        assert_eq!(doc["energy_production"]["total_kwh"], 12.5);
        assert_eq!(doc["environmental_conditions"]["temperature_range"]["min"], 18.0);
        assert_eq!(doc["verification"]["hash"], "ab".repeat(32));
        assert_eq!(doc["regional_compliance"]["grid_standard"], "220V_50Hz");
        assert_eq!(doc["version"], "1.0");
    }

    #[test]
    fn test_payload_is_stable_for_same_report() {
        let report = sample_report();
        assert_eq!(build_payload(&report).unwrap(), build_payload(&report).unwrap());
    }
}
