//! Raw telemetry reading model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// One timestamped sample from an energy-monitoring device.
///
/// Every measurement is optional because field firmware omits sensors it does not have.
/// The aggregator decides what a missing value means for each metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RawReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
    pub power: Option<f64>,
    pub total_energy_kwh: Option<f64>,
    pub grid_frequency_hz: Option<f64>,
    pub power_factor: Option<f64>,
    pub ambient_temp_c: Option<f64>,
    pub irradiance_w_m2: Option<f64>,
    pub efficiency: Option<f64>,
    pub system_status: Option<i32>,
}

impl RawReading {
    /// A reading with only device and timestamp set.
    pub fn empty(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            current: None,
            voltage: None,
            power: None,
            total_energy_kwh: None,
            grid_frequency_hz: None,
            power_factor: None,
            ambient_temp_c: None,
            irradiance_w_m2: None,
            efficiency: None,
            system_status: None,
        }
    }
}

lazy_static::lazy_static! {
    pub static ref DEVICE_ID_REGEX: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$").unwrap();
}

/// Request payload for ingesting one reading.
///
/// Only structural checks happen here. Out-of-band but well-formed values are stored
/// and later rejected by the aggregator so that they count toward data quality.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct IngestReadingRequest {
    #[validate(regex(
        path = *DEVICE_ID_REGEX,
        message = "device_id must be 1-64 characters of letters, digits, '_', '.', ':' or '-'"
    ))]
    pub device_id: String,

    pub timestamp: DateTime<Utc>,

    #[validate(range(min = -1000.0, max = 1000.0, message = "current must be within ±1000 A"))]
    pub current: Option<f64>,

    #[validate(range(min = -1000.0, max = 1000.0, message = "voltage must be within ±1000 V"))]
    pub voltage: Option<f64>,

    #[validate(range(min = -1.0e6, max = 1.0e6, message = "power must be within ±1 MW"))]
    pub power: Option<f64>,

    #[validate(range(min = -1.0e9, max = 1.0e9, message = "total_energy_kwh is out of range"))]
    pub total_energy_kwh: Option<f64>,

    #[validate(range(min = 0.0, max = 1000.0, message = "grid_frequency_hz is out of range"))]
    pub grid_frequency_hz: Option<f64>,

    #[validate(range(min = 0.0, max = 1.0, message = "power_factor must be within [0, 1]"))]
    pub power_factor: Option<f64>,

    #[validate(range(min = -100.0, max = 150.0, message = "ambient_temp_c is out of range"))]
    pub ambient_temp_c: Option<f64>,

    #[validate(range(min = -1.0e4, max = 1.0e4, message = "irradiance_w_m2 is out of range"))]
    pub irradiance_w_m2: Option<f64>,

    #[validate(range(min = 0.0, max = 1.0, message = "efficiency must be within [0, 1]"))]
    pub efficiency: Option<f64>,

    pub system_status: Option<i32>,
}

impl From<IngestReadingRequest> for RawReading {
    fn from(req: IngestReadingRequest) -> Self {
        Self {
            device_id: req.device_id,
            timestamp: req.timestamp,
            current: req.current,
            voltage: req.voltage,
            power: req.power,
            total_energy_kwh: req.total_energy_kwh,
            grid_frequency_hz: req.grid_frequency_hz,
            power_factor: req.power_factor,
            ambient_temp_c: req.ambient_temp_c,
            irradiance_w_m2: req.irradiance_w_m2,
            efficiency: req.efficiency,
            system_status: req.system_status,
        }
    }
}

/// Response payload after a reading has been stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestReadingResponse {
    pub id: i64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}
