//! Reading store abstraction.

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::RawReading;

/// Source of raw telemetry, append-only.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// Readings for `device_id` with `start <= timestamp < end`, ordered by timestamp.
    async fn readings_in_window(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, StoreError>;

    /// Distinct devices that reported at least once in the window.
    async fn devices_with_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Store one reading and return its row id.
    async fn append(&self, reading: RawReading) -> Result<i64, StoreError>;
}

/// In-memory reading store for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryReadingStore {
    readings: RwLock<Vec<RawReading>>,
}

impl InMemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: Vec<RawReading>) -> Self {
        Self {
            readings: RwLock::new(readings),
        }
    }
}

#[async_trait::async_trait]
impl ReadingStore for InMemoryReadingStore {
    async fn readings_in_window(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, StoreError> {
        let readings = self.readings.read().await;
        let mut matched: Vec<RawReading> = readings
            .iter()
            .filter(|r| r.device_id == device_id && r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.timestamp);
        Ok(matched)
    }

    async fn devices_with_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let readings = self.readings.read().await;
        let mut devices: Vec<String> = readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .map(|r| r.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    async fn append(&self, reading: RawReading) -> Result<i64, StoreError> {
        let mut readings = self.readings.write().await;
        readings.push(reading);
        Ok(readings.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_window_is_half_open_and_sorted() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let store = InMemoryReadingStore::with_readings(vec![
            RawReading::empty("a", t0 + Duration::hours(2)),
            RawReading::empty("a", t0),
            RawReading::empty("a", t0 + Duration::hours(24)),
            RawReading::empty("b", t0 + Duration::hours(1)),
        ]);

        let got = store
            .readings_in_window("a", t0, t0 + Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].timestamp < got[1].timestamp);

        let devices = store
            .devices_with_readings(t0, t0 + Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(devices, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let store = InMemoryReadingStore::new();
        let first = store.append(RawReading::empty("a", t0)).await.unwrap();
        let second = store
            .append(RawReading::empty("a", t0 + Duration::minutes(1)))
            .await
            .unwrap();
        assert!(second > first);
        assert_eq!(
            store
                .readings_in_window("a", t0, t0 + Duration::hours(1))
                .await
                .unwrap()
                .len(),
            2
        );
    }
}
