//! Telemetry aggregator.
//!
//! Turns the raw readings of one device over one reporting window into an
//! [`AggregatedEnergyReport`], and decides whether that report is good enough to
//! submit to the registry. Everything except [`Aggregator`] itself is a pure function.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use shared::crypto::Fingerprint;
use shared::validation::Band;

use crate::error::AggregationError;
use crate::models::readiness::{
    CHECK_DATA_COMPLETENESS, CHECK_DATA_INTEGRITY, CHECK_ENERGY_PRODUCTION,
    CHECK_SUFFICIENT_READINGS,
};
use crate::models::{
    AggregatedEnergyReport, DataQualityMetrics, EnergyMetrics, EnvironmentalMetrics,
    PerformanceMetrics, RawReading, ReadinessCheck, ReadinessResult, ReadinessThresholds,
    RegionalCompliance, ReportingWindow,
};
use crate::services::reading_store::ReadingStore;

/// Domain tag mixed into every verification hash.
const HASH_DOMAIN: &str = "energy-report/v1";

const DEFAULT_EFFICIENCY: f64 = 0.96;
const DEFAULT_POWER_FACTOR: f64 = 0.95;
const DEFAULT_TEMPERATURE_C: f64 = 25.0;

/// Assumed sample spacing when energy has to be integrated from power.
const SAMPLES_PER_HOUR: f64 = 60.0;

/// Fixed rule set applied to every reading and report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRules {
    pub voltage: Band,
    pub frequency: Band,
    pub temperature_c: Band,
    pub irradiance_w_m2: Band,
    pub efficiency: Band,
    pub power_factor: Band,
    /// Nameplate capacity used for the capacity factor.
    pub rated_capacity_w: f64,
    pub compliance: RegionalCompliance,
}

impl AggregationRules {
    /// Rules for a grid with the given nominal voltage and frequency.
    pub fn for_grid(nominal_voltage: f64, nominal_frequency: f64) -> Self {
        let compliance = RegionalCompliance {
            nominal_voltage_v: nominal_voltage,
            nominal_frequency_hz: nominal_frequency,
            ..RegionalCompliance::default()
        };
        Self {
            voltage: Band::around(
                nominal_voltage,
                compliance.voltage_tolerance_percent / 100.0,
            ),
            frequency: Band::around(
                nominal_frequency,
                compliance.frequency_tolerance_percent / 100.0,
            ),
            temperature_c: Band::new(-20.0, 60.0),
            irradiance_w_m2: Band::new(0.0, 1500.0),
            efficiency: Band::new(0.0, 1.0),
            power_factor: Band::new(0.0, 1.0),
            rated_capacity_w: 5000.0,
            compliance,
        }
    }

    pub fn with_rated_capacity(mut self, rated_capacity_w: f64) -> Self {
        self.rated_capacity_w = rated_capacity_w;
        self
    }
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self::for_grid(220.0, 50.0)
    }
}

/// Why a reading was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    MissingPower,
    NotFinite,
    NegativePower,
    VoltageOutOfBand,
    FrequencyOutOfBand,
    EfficiencyOutOfRange,
    PowerFactorOutOfRange,
    TemperatureOutOfBand,
    IrradianceOutOfRange,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingPower => "missing_power",
            RejectReason::NotFinite => "not_finite",
            RejectReason::NegativePower => "negative_power",
            RejectReason::VoltageOutOfBand => "voltage_out_of_band",
            RejectReason::FrequencyOutOfBand => "frequency_out_of_band",
            RejectReason::EfficiencyOutOfRange => "efficiency_out_of_range",
            RejectReason::PowerFactorOutOfRange => "power_factor_out_of_range",
            RejectReason::TemperatureOutOfBand => "temperature_out_of_band",
            RejectReason::IrradianceOutOfRange => "irradiance_out_of_range",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify one reading as clean or rejected.
///
/// Absent optional measurements skip their check. A present value that is NaN or
/// infinite rejects the reading outright.
pub fn check_reading(reading: &RawReading, rules: &AggregationRules) -> Result<(), RejectReason> {
    let present = [
        reading.current,
        reading.voltage,
        reading.power,
        reading.total_energy_kwh,
        reading.grid_frequency_hz,
        reading.power_factor,
        reading.ambient_temp_c,
        reading.irradiance_w_m2,
        reading.efficiency,
    ];
    if present.iter().flatten().any(|v| !v.is_finite()) {
        return Err(RejectReason::NotFinite);
    }

    let power = reading.power.ok_or(RejectReason::MissingPower)?;
    if power < 0.0 {
        return Err(RejectReason::NegativePower);
    }

    let checks = [
        (reading.voltage, &rules.voltage, RejectReason::VoltageOutOfBand),
        (reading.grid_frequency_hz, &rules.frequency, RejectReason::FrequencyOutOfBand),
        (reading.efficiency, &rules.efficiency, RejectReason::EfficiencyOutOfRange),
        (reading.power_factor, &rules.power_factor, RejectReason::PowerFactorOutOfRange),
        (reading.ambient_temp_c, &rules.temperature_c, RejectReason::TemperatureOutOfBand),
        (reading.irradiance_w_m2, &rules.irradiance_w_m2, RejectReason::IrradianceOutOfRange),
    ];
    for (value, band, reason) in checks {
        if let Some(v) = value {
            if !band.contains(v) {
                return Err(reason);
            }
        }
    }
    Ok(())
}

/// Readings split into the clean set and rejection tallies.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedReadings {
    /// Clean readings ordered by timestamp.
    pub valid: Vec<RawReading>,
    pub total: usize,
    pub rejected: BTreeMap<RejectReason, u32>,
}

impl CleanedReadings {
    pub fn rejected_count(&self) -> u32 {
        self.rejected.values().sum()
    }
}

/// Validate every reading that belongs to `device_id` and falls inside `window`.
///
/// Readings for other devices or outside the window are not counted at all.
pub fn clean_readings(
    device_id: &str,
    window: &ReportingWindow,
    readings: Vec<RawReading>,
    rules: &AggregationRules,
) -> CleanedReadings {
    let mut valid = Vec::with_capacity(readings.len());
    let mut rejected = BTreeMap::new();
    let mut total = 0;

    for reading in readings {
        if reading.device_id != device_id || !window.contains(reading.timestamp) {
            continue;
        }
        total += 1;
        match check_reading(&reading, rules) {
            Ok(()) => valid.push(reading),
            Err(reason) => *rejected.entry(reason).or_insert(0) += 1,
        }
    }
    valid.sort_by_key(|r| r.timestamp);

    CleanedReadings {
        valid,
        total,
        rejected,
    }
}

/// Energy delivered according to the cumulative counters, in kWh.
///
/// Sums the increases between consecutive counter values. A decrease is a counter
/// reset and starts a new epoch, so the drop itself contributes nothing. Returns
/// `None` when no reading carries a positive counter.
pub fn counter_energy_kwh(sorted: &[RawReading]) -> Option<f64> {
    let counters: Vec<f64> = sorted
        .iter()
        .filter_map(|r| r.total_energy_kwh)
        .filter(|c| *c >= 0.0)
        .collect();
    if !counters.iter().any(|c| *c > 0.0) {
        return None;
    }
    Some(
        counters
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|delta| *delta > 0.0)
            .sum(),
    )
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn collect(valid: &[RawReading], field: impl Fn(&RawReading) -> Option<f64>) -> Vec<f64> {
    valid.iter().filter_map(field).collect()
}

/// Energy and power statistics over the clean set. `valid` must be non-empty.
pub fn energy_metrics(valid: &[RawReading], rules: &AggregationRules) -> EnergyMetrics {
    let powers = collect(valid, |r| r.power);
    let avg_power_w = mean(&powers).unwrap_or(0.0);
    let max_power_w = max_of(&powers).unwrap_or(0.0);
    let min_power_w = min_of(&powers).unwrap_or(0.0);

    let total_energy_kwh = counter_energy_kwh(valid)
        .unwrap_or_else(|| avg_power_w * (powers.len() as f64 / SAMPLES_PER_HOUR) / 1000.0);

    let peak_to_avg_ratio = if avg_power_w > 0.0 {
        max_power_w / avg_power_w
    } else {
        0.0
    };
    let capacity_factor = if rules.rated_capacity_w > 0.0 {
        (avg_power_w / rules.rated_capacity_w).clamp(0.0, 1.0)
    } else {
        0.0
    };

    EnergyMetrics {
        total_energy_kwh,
        avg_power_w,
        max_power_w,
        min_power_w,
        peak_to_avg_ratio,
        capacity_factor,
    }
}

pub fn performance_metrics(valid: &[RawReading], rules: &AggregationRules) -> PerformanceMetrics {
    let efficiencies = collect(valid, |r| r.efficiency);
    let power_factors = collect(valid, |r| r.power_factor);
    let frequencies = collect(valid, |r| r.grid_frequency_hz);

    PerformanceMetrics {
        avg_efficiency: mean(&efficiencies).unwrap_or(DEFAULT_EFFICIENCY),
        max_efficiency: max_of(&efficiencies).unwrap_or(DEFAULT_EFFICIENCY),
        min_efficiency: min_of(&efficiencies).unwrap_or(DEFAULT_EFFICIENCY),
        avg_power_factor: mean(&power_factors).unwrap_or(DEFAULT_POWER_FACTOR),
        avg_grid_frequency_hz: mean(&frequencies)
            .unwrap_or(rules.compliance.nominal_frequency_hz),
    }
}

pub fn environmental_metrics(valid: &[RawReading]) -> EnvironmentalMetrics {
    let irradiance = collect(valid, |r| r.irradiance_w_m2);
    let temperatures = collect(valid, |r| r.ambient_temp_c);

    EnvironmentalMetrics {
        avg_irradiance_w_m2: mean(&irradiance).unwrap_or(0.0),
        max_irradiance_w_m2: max_of(&irradiance).unwrap_or(0.0),
        avg_temperature_c: mean(&temperatures).unwrap_or(DEFAULT_TEMPERATURE_C),
        max_temperature_c: max_of(&temperatures).unwrap_or(DEFAULT_TEMPERATURE_C),
        min_temperature_c: min_of(&temperatures).unwrap_or(DEFAULT_TEMPERATURE_C),
    }
}

pub fn data_quality(cleaned: &CleanedReadings, window: &ReportingWindow) -> DataQualityMetrics {
    let total = cleaned.total as u32;
    let valid = cleaned.valid.len() as u32;
    let rejected = total.saturating_sub(valid);
    let completeness = if total > 0 {
        valid as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    DataQualityMetrics {
        total_readings: total,
        valid_readings: valid,
        missing_readings: rejected,
        data_completeness_percent: completeness,
        outlier_count: rejected,
        measurement_period_hours: window.hours(),
    }
}

const COMPLETENESS_WEIGHT: f64 = 0.6;

/// `0.6 × completeness + 0.4 × (1 - outlier ratio)`, clamped to `[0, 1]`.
///
/// Every rejected reading counts both as missing and as an outlier, so the two
/// terms are equal for aggregated reports and the score is the completeness
/// fraction. The weighting only matters for metrics built elsewhere.
pub fn integrity_score(quality: &DataQualityMetrics) -> f64 {
    if quality.total_readings == 0 {
        return 0.0;
    }
    let w = COMPLETENESS_WEIGHT;
    let completeness = (quality.data_completeness_percent / 100.0).clamp(0.0, 1.0);
    let outlier_ratio = quality.outlier_count as f64 / quality.total_readings as f64;
    let score = w * completeness + (1.0 - w) * (1.0 - outlier_ratio);
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn render(value: Option<f64>) -> String {
    match value {
        // -0.0 and 0.0 are the same measurement.
        Some(v) if v == 0.0 => "0".to_string(),
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

fn canonical_line(r: &RawReading) -> String {
    let fields = [
        r.current,
        r.voltage,
        r.power,
        r.total_energy_kwh,
        r.grid_frequency_hz,
        r.power_factor,
        r.ambient_temp_c,
        r.irradiance_w_m2,
        r.efficiency,
    ];
    let mut line = r.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
    for value in fields {
        line.push('|');
        line.push_str(&render(value));
    }
    line.push('|');
    line.push_str(&r.system_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()));
    line
}

/// Deterministic SHA-256 fingerprint of a device's clean readings and energy metrics.
///
/// Readings are rendered to canonical lines and sorted, so input order never matters.
pub fn verification_hash(device_id: &str, valid: &[RawReading], energy: &EnergyMetrics) -> String {
    let mut lines: Vec<String> = valid.iter().map(canonical_line).collect();
    lines.sort_unstable();

    let mut fp = Fingerprint::new(HASH_DOMAIN);
    fp.field("device_id", device_id)
        .int("readings", lines.len() as i64);
    for line in &lines {
        fp.field("reading", line);
    }
    fp.float("total_energy_kwh", energy.total_energy_kwh, 6)
        .float("avg_power_w", energy.avg_power_w, 6)
        .float("max_power_w", energy.max_power_w, 6)
        .float("min_power_w", energy.min_power_w, 6)
        .float("peak_to_avg_ratio", energy.peak_to_avg_ratio, 6)
        .float("capacity_factor", energy.capacity_factor, 6);
    fp.finish()
}

/// Build a report from readings already fetched for `window`.
pub fn aggregate(
    device_id: &str,
    window: &ReportingWindow,
    readings: Vec<RawReading>,
    rules: &AggregationRules,
) -> Result<AggregatedEnergyReport, AggregationError> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(AggregationError::InvalidArgument(
            "device_id must not be empty".to_string(),
        ));
    }

    let cleaned = clean_readings(device_id, window, readings, rules);
    if cleaned.total == 0 {
        return Err(AggregationError::NoData {
            device_id: device_id.to_string(),
            start: window.start(),
            end: window.end(),
        });
    }
    if cleaned.valid.is_empty() {
        return Err(AggregationError::InsufficientData {
            device_id: device_id.to_string(),
            total: cleaned.total,
        });
    }

    if !cleaned.rejected.is_empty() {
        tracing::debug!(
            device_id = %device_id,
            rejected = ?cleaned.rejected,
            "Readings rejected during cleaning"
        );
    }

    let energy = energy_metrics(&cleaned.valid, rules);
    let quality = data_quality(&cleaned, window);
    let verification_hash = verification_hash(device_id, &cleaned.valid, &energy);

    Ok(AggregatedEnergyReport {
        device_id: device_id.to_string(),
        period_start: window.start(),
        period_end: window.end(),
        performance_metrics: performance_metrics(&cleaned.valid, rules),
        environmental_metrics: environmental_metrics(&cleaned.valid),
        data_integrity_score: integrity_score(&quality),
        data_quality: quality,
        energy_metrics: energy,
        verification_hash,
        regional_compliance: rules.compliance.clone(),
    })
}

/// Evaluate the named readiness checks for a report.
pub fn evaluate_readiness(
    report: &AggregatedEnergyReport,
    thresholds: &ReadinessThresholds,
) -> ReadinessResult {
    let mut checks = BTreeMap::new();
    checks.insert(
        CHECK_DATA_COMPLETENESS.to_string(),
        ReadinessCheck::at_least(
            report.data_quality.data_completeness_percent,
            thresholds.min_completeness_percent,
        ),
    );
    checks.insert(
        CHECK_DATA_INTEGRITY.to_string(),
        ReadinessCheck::at_least(report.data_integrity_score, thresholds.min_integrity_score),
    );
    checks.insert(
        CHECK_SUFFICIENT_READINGS.to_string(),
        ReadinessCheck::at_least(
            report.data_quality.valid_readings as f64,
            thresholds.min_readings as f64,
        ),
    );
    checks.insert(
        CHECK_ENERGY_PRODUCTION.to_string(),
        ReadinessCheck::at_least(
            report.energy_metrics.total_energy_kwh,
            thresholds.min_energy_kwh,
        ),
    );

    let passed = checks.values().filter(|c| c.passed).count();
    let registry_ready = passed == checks.len();
    let summary = if registry_ready {
        format!("Ready for registry submission ({}/{} checks passed)", passed, checks.len())
    } else {
        format!("Not ready ({}/{} checks passed)", passed, checks.len())
    };

    ReadinessResult {
        device_id: report.device_id.clone(),
        period_start: report.period_start,
        period_end: report.period_end,
        registry_ready,
        checks,
        summary,
        reason: None,
    }
}

/// Aggregator bound to a reading store.
#[derive(Clone)]
pub struct Aggregator {
    readings: Arc<dyn ReadingStore>,
    rules: AggregationRules,
    thresholds: ReadinessThresholds,
}

impl Aggregator {
    pub fn new(readings: Arc<dyn ReadingStore>, rules: AggregationRules) -> Self {
        Self {
            readings,
            rules,
            thresholds: ReadinessThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ReadinessThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn rules(&self) -> &AggregationRules {
        &self.rules
    }

    pub fn thresholds(&self) -> &ReadinessThresholds {
        &self.thresholds
    }

    /// Aggregate an explicit `[start, end)` window.
    pub async fn aggregate_period(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AggregatedEnergyReport, AggregationError> {
        let window = ReportingWindow::new(start, end)?;
        self.aggregate_window(device_id, &window).await
    }

    /// Aggregate one UTC calendar day.
    pub async fn aggregate_daily(
        &self,
        device_id: &str,
        date: NaiveDate,
    ) -> Result<AggregatedEnergyReport, AggregationError> {
        self.aggregate_window(device_id, &ReportingWindow::day(date))
            .await
    }

    /// Aggregate the 24 hours ending at `now`.
    pub async fn aggregate_rolling(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AggregatedEnergyReport, AggregationError> {
        self.aggregate_window(device_id, &ReportingWindow::rolling_day(now))
            .await
    }

    #[tracing::instrument(skip(self), fields(start = %window.start(), end = %window.end()))]
    pub async fn aggregate_window(
        &self,
        device_id: &str,
        window: &ReportingWindow,
    ) -> Result<AggregatedEnergyReport, AggregationError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(AggregationError::InvalidArgument(
                "device_id must not be empty".to_string(),
            ));
        }

        let started = Instant::now();
        let readings = self
            .readings
            .readings_in_window(device_id, window.start(), window.end())
            .await?;
        let result = aggregate(device_id, window, readings, &self.rules);
        histogram!("aggregation_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                let rejected = report.data_quality.outlier_count;
                if rejected > 0 {
                    counter!("aggregation_readings_rejected_total").increment(rejected as u64);
                }
                tracing::info!(
                    device_id = %device_id,
                    valid = report.data_quality.valid_readings,
                    total = report.data_quality.total_readings,
                    energy_kwh = report.energy_metrics.total_energy_kwh,
                    "Aggregated energy report"
                );
            }
            Err(e) => tracing::info!(device_id = %device_id, error = %e, "Aggregation produced no report"),
        }
        result
    }

    /// Re-run aggregation and evaluate readiness. Never touches submission state.
    ///
    /// Missing or entirely rejected data gives a not-ready result with a reason.
    /// Bad arguments and storage failures are still errors.
    pub async fn validate_registry_readiness(
        &self,
        device_id: &str,
        window: &ReportingWindow,
    ) -> Result<ReadinessResult, AggregationError> {
        match self.aggregate_window(device_id, window).await {
            Ok(report) => Ok(evaluate_readiness(&report, &self.thresholds)),
            Err(e) if e.is_recoverable() => Ok(ReadinessResult {
                device_id: device_id.trim().to_string(),
                period_start: window.start(),
                period_end: window.end(),
                registry_ready: false,
                checks: BTreeMap::new(),
                summary: "Not ready (no usable data)".to_string(),
                reason: Some(e.to_string()),
            }),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("rules", &self.rules)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reading_store::InMemoryReadingStore;
    use chrono::{Duration, TimeZone};

    const DEVICE: &str = "ESP32_001";

    fn day() -> ReportingWindow {
        ReportingWindow::day(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
    }

    fn reading(minute: i64, power: f64, counter: Option<f64>) -> RawReading {
        let mut r = RawReading::empty(DEVICE, day().start() + Duration::minutes(minute));
        r.power = Some(power);
        r.voltage = Some(230.0);
        r.current = Some(power / 230.0);
        r.grid_frequency_hz = Some(50.0);
        r.power_factor = Some(0.98);
        r.efficiency = Some(0.95);
        r.ambient_temp_c = Some(28.0);
        r.irradiance_w_m2 = Some(800.0);
        r.total_energy_kwh = counter;
        r
    }

    fn series(n: i64) -> Vec<RawReading> {
        (0..n)
            .map(|i| reading(i, 1000.0 + i as f64, Some(10.0 + i as f64 * 0.02)))
            .collect()
    }

    #[test]
    fn test_rejection_rules() {
        let rules = AggregationRules::default();
        let ok = reading(0, 500.0, None);
        assert_eq!(check_reading(&ok, &rules), Ok(()));

        let mut r = ok.clone();
        r.power = Some(-1.0);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::NegativePower));

        let mut r = ok.clone();
        r.voltage = Some(300.0);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::VoltageOutOfBand));

        let mut r = ok.clone();
        r.grid_frequency_hz = Some(48.0);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::FrequencyOutOfBand));

        let mut r = ok.clone();
        r.efficiency = Some(1.2);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::EfficiencyOutOfRange));

        let mut r = ok.clone();
        r.ambient_temp_c = Some(-25.0);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::TemperatureOutOfBand));

        let mut r = ok.clone();
        r.irradiance_w_m2 = Some(1600.0);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::IrradianceOutOfRange));

        let mut r = ok.clone();
        r.current = Some(f64::NAN);
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::NotFinite));

        let mut r = ok;
        r.power = None;
        assert_eq!(check_reading(&r, &rules), Err(RejectReason::MissingPower));
    }

    #[test]
    fn test_absent_optional_fields_are_not_rejected() {
        let mut r = RawReading::empty(DEVICE, day().start());
        r.power = Some(10.0);
        assert_eq!(check_reading(&r, &AggregationRules::default()), Ok(()));
    }

    #[test]
    fn test_invalid_reading_counts_toward_quality() {
        let mut readings = series(3);
        let mut bad = reading(3, 1000.0, Some(11.0));
        bad.voltage = Some(300.0);
        readings.push(bad);

        let report = aggregate(DEVICE, &day(), readings, &AggregationRules::default()).unwrap();
        assert_eq!(report.data_quality.total_readings, 4);
        assert_eq!(report.data_quality.valid_readings, 3);
        assert_eq!(report.data_quality.outlier_count, 1);
        assert_eq!(report.data_quality.missing_readings, 1);
        assert!((report.data_quality.data_completeness_percent - 75.0).abs() < 1e-9);
        // Rejections count as both missing and outliers, so integrity tracks completeness.
        assert!((report.data_integrity_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_readings_outside_window_or_device_are_ignored() {
        let mut readings = series(2);
        let mut other = reading(5, 100.0, None);
        other.device_id = "OTHER".into();
        readings.push(other);
        readings.push(reading(24 * 60, 100.0, None));

        let report = aggregate(DEVICE, &day(), readings, &AggregationRules::default()).unwrap();
        assert_eq!(report.data_quality.total_readings, 2);
    }

    #[test]
    fn test_no_data_and_insufficient_data() {
        let rules = AggregationRules::default();
        let err = aggregate(DEVICE, &day(), vec![], &rules).unwrap_err();
        assert!(matches!(err, AggregationError::NoData { .. }));

        let mut bad = reading(0, 100.0, None);
        bad.power = Some(-5.0);
        let err = aggregate(DEVICE, &day(), vec![bad], &rules).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::InsufficientData { total: 1, .. }
        ));
    }

    #[test]
    fn test_empty_device_id_is_invalid() {
        let err = aggregate("  ", &day(), series(3), &AggregationRules::default()).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidArgument(_)));
    }

    #[test]
    fn test_energy_from_counters() {
        let readings = vec![
            reading(0, 1000.0, Some(10.0)),
            reading(1, 2000.0, Some(10.5)),
            reading(2, 3000.0, Some(11.5)),
        ];
        let m = energy_metrics(&readings, &AggregationRules::default());
        assert!((m.total_energy_kwh - 1.5).abs() < 1e-9);
        assert_eq!(m.avg_power_w, 2000.0);
        assert_eq!(m.max_power_w, 3000.0);
        assert_eq!(m.min_power_w, 1000.0);
        assert!((m.peak_to_avg_ratio - 1.5).abs() < 1e-9);
        assert!((m.capacity_factor - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_counter_reset_starts_new_epoch() {
        let readings = vec![
            reading(0, 100.0, Some(5.0)),
            reading(1, 100.0, Some(7.0)),
            reading(2, 100.0, Some(0.5)),
            reading(3, 100.0, Some(1.5)),
        ];
        assert!((counter_energy_kwh(&readings).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_falls_back_to_power_integral() {
        let readings: Vec<RawReading> = (0..60).map(|i| reading(i, 600.0, None)).collect();
        let m = energy_metrics(&readings, &AggregationRules::default());
        assert!((m.total_energy_kwh - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_zero_average_power_has_zero_peak_ratio() {
        let readings = vec![reading(0, 0.0, None), reading(1, 0.0, None)];
        let m = energy_metrics(&readings, &AggregationRules::default());
        assert_eq!(m.peak_to_avg_ratio, 0.0);
        assert_eq!(m.capacity_factor, 0.0);
        assert_eq!(m.total_energy_kwh, 0.0);
    }

    #[test]
    fn test_capacity_factor_is_capped() {
        let readings = vec![reading(0, 9000.0, None)];
        let m = energy_metrics(&readings, &AggregationRules::default());
        assert_eq!(m.capacity_factor, 1.0);
    }

    #[test]
    fn test_metric_defaults_when_fields_absent() {
        let mut r = RawReading::empty(DEVICE, day().start());
        r.power = Some(100.0);
        let perf = performance_metrics(&[r.clone()], &AggregationRules::default());
        assert_eq!(perf.avg_efficiency, 0.96);
        assert_eq!(perf.avg_power_factor, 0.95);
        assert_eq!(perf.avg_grid_frequency_hz, 50.0);

        let env = environmental_metrics(&[r]);
        assert_eq!(env.avg_temperature_c, 25.0);
        assert_eq!(env.max_irradiance_w_m2, 0.0);
    }

    #[test]
    fn test_integrity_score_boundaries() {
        let perfect = DataQualityMetrics {
            total_readings: 10,
            valid_readings: 10,
            missing_readings: 0,
            data_completeness_percent: 100.0,
            outlier_count: 0,
            measurement_period_hours: 24.0,
        };
        assert_eq!(integrity_score(&perfect), 1.0);

        let worst = DataQualityMetrics {
            valid_readings: 0,
            missing_readings: 10,
            data_completeness_percent: 0.0,
            outlier_count: 10,
            ..perfect.clone()
        };
        assert_eq!(integrity_score(&worst), 0.0);

        let half = DataQualityMetrics {
            valid_readings: 5,
            missing_readings: 5,
            data_completeness_percent: 50.0,
            outlier_count: 5,
            ..perfect
        };
        assert!((integrity_score(&half) - 0.5).abs() < 1e-9);

        // Outliers counted apart from completeness still pull the score down.
        let noisy = DataQualityMetrics {
            outlier_count: 10,
            ..half
        };
        assert!((integrity_score(&noisy) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_hash_is_deterministic_and_order_independent() {
        let rules = AggregationRules::default();
        let a = aggregate(DEVICE, &day(), series(10), &rules).unwrap();
        let b = aggregate(DEVICE, &day(), series(10), &rules).unwrap();
        assert_eq!(a.verification_hash, b.verification_hash);
        assert_eq!(a.verification_hash.len(), 64);

        let mut reversed = series(10);
        reversed.reverse();
        let c = aggregate(DEVICE, &day(), reversed, &rules).unwrap();
        assert_eq!(a.verification_hash, c.verification_hash);
    }

    #[test]
    fn test_hash_changes_with_device_or_power() {
        let valid = series(5);
        let energy = energy_metrics(&valid, &AggregationRules::default());
        let base = verification_hash(DEVICE, &valid, &energy);

        assert_ne!(base, verification_hash("ESP32_002", &valid, &energy));

        let mut changed = valid.clone();
        changed[2].power = Some(changed[2].power.unwrap() + 0.001);
        assert_ne!(base, verification_hash(DEVICE, &changed, &energy));
    }

    #[test]
    fn test_readiness_fails_on_low_completeness() {
        let mut readings = series(3);
        for i in 3..5 {
            let mut bad = reading(i, 100.0, None);
            bad.voltage = Some(300.0);
            readings.push(bad);
        }
        let report = aggregate(DEVICE, &day(), readings, &AggregationRules::default()).unwrap();
        let result = evaluate_readiness(&report, &ReadinessThresholds::default());

        let completeness = result.check(CHECK_DATA_COMPLETENESS).unwrap();
        assert!((completeness.value - 60.0).abs() < 1e-9);
        assert_eq!(completeness.threshold, 80.0);
        assert!(!completeness.passed);
        assert!(!result.registry_ready);
        assert!(result.failed_checks().contains(&CHECK_DATA_COMPLETENESS));
    }

    #[test]
    fn test_readiness_passes_for_full_day() {
        let report = aggregate(DEVICE, &day(), series(200), &AggregationRules::default()).unwrap();
        let result = evaluate_readiness(&report, &ReadinessThresholds::default());
        assert!(result.registry_ready, "{:?}", result.failed_checks());
        assert_eq!(result.checks.len(), 4);
    }

    #[tokio::test]
    async fn test_aggregator_reads_from_store() {
        let store = Arc::new(InMemoryReadingStore::with_readings(series(120)));
        let aggregator = Aggregator::new(store, AggregationRules::default());

        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let report = aggregator.aggregate_daily(DEVICE, date).await.unwrap();
        assert_eq!(report.data_quality.total_readings, 120);

        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let err = aggregator
            .aggregate_period(DEVICE, start, start)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_readiness_without_data_is_not_an_error() {
        let aggregator = Aggregator::new(
            Arc::new(InMemoryReadingStore::new()),
            AggregationRules::default(),
        );
        let result = aggregator
            .validate_registry_readiness(DEVICE, &day())
            .await
            .unwrap();
        assert!(!result.registry_ready);
        assert!(result.reason.is_some());

        let err = aggregator
            .validate_registry_readiness("", &day())
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::InvalidArgument(_)));
    }
}
