//! Sensor reading entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::RawReading;
use sqlx::FromRow;

/// Database row mapping for the sensor_readings table.
#[derive(Debug, Clone, FromRow)]
pub struct SensorReadingEntity {
    pub id: i64,
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
    pub created_at: DateTime<Utc>,
}

impl From<SensorReadingEntity> for RawReading {
    fn from(entity: SensorReadingEntity) -> Self {
        Self {
            device_id: entity.device_id,
            timestamp: entity.timestamp,
            current: entity.current,
            voltage: entity.voltage,
            power: entity.power,
            total_energy_kwh: entity.total_energy_kwh,
            grid_frequency_hz: entity.grid_frequency_hz,
            power_factor: entity.power_factor,
            ambient_temp_c: entity.ambient_temp_c,
            irradiance_w_m2: entity.irradiance_w_m2,
            efficiency: entity.efficiency,
            system_status: entity.system_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_to_reading() {
        let now = Utc::now();
        let entity = SensorReadingEntity {
            id: 7,
            device_id: "ESP32_001".to_string(),
            timestamp: now,
            current: Some(4.2),
            voltage: Some(229.0),
            power: Some(960.0),
            total_energy_kwh: Some(1234.5),
            grid_frequency_hz: Some(50.0),
            power_factor: None,
            ambient_temp_c: Some(31.0),
            irradiance_w_m2: None,
            efficiency: Some(0.94),
            system_status: Some(1),
            created_at: now,
        };

        let reading: RawReading = entity.into();
        assert_eq!(reading.device_id, "ESP32_001");
        assert_eq!(reading.power, Some(960.0));
        assert!(reading.power_factor.is_none());
        assert_eq!(reading.system_status, Some(1));
    }
}
