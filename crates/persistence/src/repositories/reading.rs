//! Sensor reading repository.

use chrono::{DateTime, Utc};
use domain::models::RawReading;
use domain::services::ReadingStore;
use domain::StoreError;
use sqlx::PgPool;

use super::store_error;
use crate::entities::SensorReadingEntity;
use crate::metrics::QueryTimer;

/// Repository for raw telemetry readings.
#[derive(Clone)]
pub struct ReadingRepository {
    pool: PgPool,
}

impl ReadingRepository {
    /// Create a new repository instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store one reading.
    pub async fn insert(&self, reading: &RawReading) -> Result<SensorReadingEntity, sqlx::Error> {
        let timer = QueryTimer::new("insert_sensor_reading");
        let result = sqlx::query_as::<_, SensorReadingEntity>(
            r#"
            INSERT INTO sensor_readings (
                device_id, timestamp, current, voltage, power, total_energy_kwh,
                grid_frequency_hz, power_factor, ambient_temp_c, irradiance_w_m2,
                efficiency, system_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, device_id, timestamp, current, voltage, power, total_energy_kwh,
                      grid_frequency_hz, power_factor, ambient_temp_c, irradiance_w_m2,
                      efficiency, system_status, created_at
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.current)
        .bind(reading.voltage)
        .bind(reading.power)
        .bind(reading.total_energy_kwh)
        .bind(reading.grid_frequency_hz)
        .bind(reading.power_factor)
        .bind(reading.ambient_temp_c)
        .bind(reading.irradiance_w_m2)
        .bind(reading.efficiency)
        .bind(reading.system_status)
        .fetch_one(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Readings for a device in `[start, end)`, oldest first.
    pub async fn find_in_window(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReadingEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_sensor_readings_in_window");
        let result = sqlx::query_as::<_, SensorReadingEntity>(
            r#"
            SELECT id, device_id, timestamp, current, voltage, power, total_energy_kwh,
                   grid_frequency_hz, power_factor, ambient_temp_c, irradiance_w_m2,
                   efficiency, system_status, created_at
            FROM sensor_readings
            WHERE device_id = $1
              AND timestamp >= $2
              AND timestamp < $3
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await;
        timer.record();
        result
    }

    /// Distinct devices with at least one reading in `[start, end)`.
    pub async fn devices_with_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, sqlx::Error> {
        let timer = QueryTimer::new("devices_with_readings");
        let result = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT device_id
            FROM sensor_readings
            WHERE timestamp >= $1 AND timestamp < $2
            ORDER BY device_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await;
        timer.record();
        result
    }
}

#[async_trait::async_trait]
impl ReadingStore for ReadingRepository {
    async fn readings_in_window(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, StoreError> {
        let entities = self
            .find_in_window(device_id, start, end)
            .await
            .map_err(store_error)?;
        Ok(entities.into_iter().map(RawReading::from).collect())
    }

    async fn devices_with_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        ReadingRepository::devices_with_readings(self, start, end)
            .await
            .map_err(store_error)
    }

    async fn append(&self, reading: RawReading) -> Result<i64, StoreError> {
        let entity = self.insert(&reading).await.map_err(store_error)?;
        Ok(entity.id)
    }
}
