//! Submission store abstraction.
//!
//! The store is the single source of truth for submission state. Every operation
//! is atomic with respect to one record. Updates are compare-and-set against an
//! [`UpdateGuard`] and must follow the state machine; terminal records are never updated.

use chrono::{DateTime, SubsecRound, Utc};
use shared::pagination::{Cursor, Page};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::submission::success_rate;
use crate::models::{
    DeviceSubmissionSummary, NewSubmission, SubmissionFilter, SubmissionRecord, SubmissionStats,
    SubmissionStatus, SubmissionUpdate, UpdateGuard,
};

#[async_trait::async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert a new record in `PENDING`.
    ///
    /// Fails with [`StoreError::Duplicate`] when a non-FAILED record already exists
    /// for the same device, period and verification hash.
    async fn create(&self, new: NewSubmission) -> Result<SubmissionRecord, StoreError>;

    /// Apply a partial update if the record still matches `guard`.
    ///
    /// Fails with [`StoreError::Terminal`] if the record is already VERIFIED or FAILED,
    /// [`StoreError::Conflict`] if it no longer matches `guard`, and
    /// [`StoreError::InvalidTransition`] if the update breaks the state machine.
    /// Every successful update refreshes `updated_at`.
    async fn update(
        &self,
        submission_id: Uuid,
        guard: UpdateGuard,
        update: SubmissionUpdate,
    ) -> Result<SubmissionRecord, StoreError>;

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError>;

    async fn get_by_document_id(
        &self,
        document_id: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError>;

    /// The current (non-FAILED) record for a device, period and hash.
    async fn find_by(
        &self,
        device_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        verification_hash: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError>;

    /// Newest first, keyset-paginated.
    async fn list(
        &self,
        filter: &SubmissionFilter,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> Result<Page<SubmissionRecord>, StoreError>;

    /// Oldest first, for resumption and polling.
    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError>;

    /// FAILED records created after `since` whose last error was retryable.
    async fn list_retryable_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError>;

    async fn stats(&self) -> Result<SubmissionStats, StoreError>;

    async fn device_summary(&self, device_id: &str)
        -> Result<DeviceSubmissionSummary, StoreError>;

    /// Retention cleanup: delete records created before `cutoff`. Returns rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory submission store for development and testing.
#[derive(Debug, Default)]
pub struct InMemorySubmissionStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<SubmissionRecord>,
    next_id: i64,
}

impl InMemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, oldest first.
    pub async fn all(&self) -> Vec<SubmissionRecord> {
        self.inner.lock().await.records.clone()
    }

    /// Overwrite a record's timestamps, for age-dependent tests.
    pub async fn backdate(&self, submission_id: Uuid, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(r) = inner
            .records
            .iter_mut()
            .find(|r| r.submission_id == submission_id)
        {
            r.created_at = created_at;
            r.updated_at = created_at;
            if r.submitted_at.is_some() {
                r.submitted_at = Some(created_at);
            }
        }
    }
}

fn is_current_for(
    r: &SubmissionRecord,
    device_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    verification_hash: &str,
) -> bool {
    r.status != SubmissionStatus::Failed
        && r.device_id == device_id
        && r.period_start == period_start
        && r.period_end == period_end
        && r.verification_hash == verification_hash
}

#[async_trait::async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn create(&self, new: NewSubmission) -> Result<SubmissionRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.records.iter().any(|r| {
            is_current_for(
                r,
                &new.device_id,
                new.period_start,
                new.period_end,
                &new.verification_hash,
            )
        }) {
            return Err(StoreError::Duplicate(format!(
                "{} {}..{}",
                new.device_id, new.period_start, new.period_end
            )));
        }

        inner.next_id += 1;
        // Match database timestamp precision so cursors round-trip exactly.
        let now = Utc::now().trunc_subsecs(6);
        let record = SubmissionRecord {
            id: inner.next_id,
            submission_id: Uuid::new_v4(),
            device_id: new.device_id,
            policy_id: new.policy_id,
            period_start: new.period_start,
            period_end: new.period_end,
            total_energy_kwh: new.total_energy_kwh,
            data_points_count: new.data_points_count,
            verification_hash: new.verification_hash,
            status: SubmissionStatus::Pending,
            registry_document_id: None,
            payload: new.payload,
            registry_response: None,
            retry_count: 0,
            error_message: None,
            last_error_class: None,
            submitted_at: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        submission_id: Uuid,
        guard: UpdateGuard,
        update: SubmissionUpdate,
    ) -> Result<SubmissionRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.submission_id == submission_id)
            .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))?;

        guard.check(record, &update)?;
        record.apply(&update, Utc::now().trunc_subsecs(6));
        Ok(record.clone())
    }

    async fn get(&self, submission_id: Uuid) -> Result<Option<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .find(|r| r.submission_id == submission_id)
            .cloned())
    }

    async fn get_by_document_id(
        &self,
        document_id: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .find(|r| r.registry_document_id.as_deref() == Some(document_id))
            .cloned())
    }

    async fn find_by(
        &self,
        device_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        verification_hash: &str,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .find(|r| is_current_for(r, device_id, period_start, period_end, verification_hash))
            .cloned())
    }

    async fn list(
        &self,
        filter: &SubmissionFilter,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> Result<Page<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SubmissionRecord> = inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .filter(|r| match cursor {
                Some(c) => (r.created_at, r.id) < (c.created_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit.max(0) as usize + 1);
        Ok(Page::from_overfetch(rows, limit, |r| {
            Cursor::new(r.created_at, r.id)
        }))
    }

    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_retryable_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.may_retry_later() && r.created_at >= since)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<SubmissionStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = SubmissionStats::default();
        let mut verification_hours = Vec::new();

        for r in &inner.records {
            stats.total += 1;
            match r.status {
                SubmissionStatus::Pending => stats.pending += 1,
                SubmissionStatus::Processing => stats.processing += 1,
                SubmissionStatus::Failed => stats.failed += 1,
                SubmissionStatus::Verified => {
                    stats.verified += 1;
                    stats.total_verified_energy_kwh += r.total_energy_kwh;
                    if let (Some(sub), Some(ver)) = (r.submitted_at, r.verified_at) {
                        verification_hours
                            .push((ver - sub).num_milliseconds() as f64 / 3_600_000.0);
                    }
                }
            }
        }

        stats.success_rate_percent = success_rate(stats.verified, stats.failed);
        if !verification_hours.is_empty() {
            stats.avg_verification_hours =
                Some(verification_hours.iter().sum::<f64>() / verification_hours.len() as f64);
        }
        Ok(stats)
    }

    async fn device_summary(
        &self,
        device_id: &str,
    ) -> Result<DeviceSubmissionSummary, StoreError> {
        let inner = self.inner.lock().await;
        let mut summary = DeviceSubmissionSummary {
            device_id: device_id.to_string(),
            total_submissions: 0,
            verified: 0,
            failed: 0,
            in_flight: 0,
            total_verified_energy_kwh: 0.0,
            last_submission_at: None,
        };

        for r in inner.records.iter().filter(|r| r.device_id == device_id) {
            summary.total_submissions += 1;
            match r.status {
                SubmissionStatus::Verified => {
                    summary.verified += 1;
                    summary.total_verified_energy_kwh += r.total_energy_kwh;
                }
                SubmissionStatus::Failed => summary.failed += 1,
                _ => summary.in_flight += 1,
            }
            summary.last_submission_at = summary.last_submission_at.max(Some(r.created_at));
        }
        Ok(summary)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.created_at >= cutoff);
        Ok((before - inner.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn new_submission(device: &str, hash: &str) -> NewSubmission {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        NewSubmission {
            device_id: device.to_string(),
            policy_id: "policy-1".to_string(),
            period_start: start,
            period_end: start + Duration::days(1),
            total_energy_kwh: 12.5,
            data_points_count: 1440,
            verification_hash: hash.to_string(),
            payload: json!({"document": {}}),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_current_record() {
        let store = InMemorySubmissionStore::new();
        let first = store.create(new_submission("d1", "h1")).await.unwrap();
        assert_eq!(first.status, SubmissionStatus::Pending);

        let err = store.create(new_submission("d1", "h1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // A different hash for the same period is a different report.
        tokio_test::assert_ok!(store.create(new_submission("d1", "h2")).await);
    }

    #[tokio::test]
    async fn test_failed_record_does_not_block_new_submission() {
        let store = InMemorySubmissionStore::new();
        let first = store.create(new_submission("d1", "h1")).await.unwrap();
        store
            .update(
                first.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store
            .find_by("d1", first.period_start, first.period_end, "h1")
            .await
            .unwrap()
            .is_none());
        tokio_test::assert_ok!(store.create(new_submission("d1", "h1")).await);
    }

    #[tokio::test]
    async fn test_terminal_records_refuse_updates() {
        let store = InMemorySubmissionStore::new();
        let rec = store.create(new_submission("d1", "h1")).await.unwrap();
        store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Failed),
                    error_message: Some("boom".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_illegal_transitions() {
        let store = InMemorySubmissionStore::new();
        let rec = store.create(new_submission("d1", "h1")).await.unwrap();

        let err = store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Verified),
                    verified_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        let err = store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    verified_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        let stored = store.get(rec.submission_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Pending);
        assert!(stored.verified_at.is_none());
    }

    #[tokio::test]
    async fn test_update_with_stale_guard_conflicts() {
        let store = InMemorySubmissionStore::new();
        let rec = store.create(new_submission("d1", "h1")).await.unwrap();

        let claim = |n: i32| SubmissionUpdate {
            retry_count: Some(n + 1),
            ..Default::default()
        };
        store
            .update(
                rec.submission_id,
                UpdateGuard::attempt(SubmissionStatus::Pending, 0),
                claim(0),
            )
            .await
            .unwrap();

        // A second driver that read the record before the first claim loses.
        let err = store
            .update(
                rec.submission_id,
                UpdateGuard::attempt(SubmissionStatus::Pending, 0),
                claim(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = store
            .update(
                rec.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let stored = store.get(rec.submission_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Processing);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_list_paginates_newest_first() {
        let store = InMemorySubmissionStore::new();
        for i in 0..5 {
            store
                .create(new_submission("d1", &format!("h{}", i)))
                .await
                .unwrap();
        }

        let filter = SubmissionFilter::default();
        let page1 = store.list(&filter, None, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.items[0].id, 5);
        let cursor = Cursor::decode(page1.next_cursor.as_deref().unwrap()).unwrap();

        let page2 = store.list(&filter, Some(cursor), 2).await.unwrap();
        assert_eq!(page2.items[0].id, 3);

        let rest = store
            .list(
                &filter,
                Some(Cursor::decode(page2.next_cursor.as_deref().unwrap()).unwrap()),
                2,
            )
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_stats_and_device_summary() {
        let store = InMemorySubmissionStore::new();
        let a = store.create(new_submission("d1", "a")).await.unwrap();
        let b = store.create(new_submission("d1", "b")).await.unwrap();
        store.create(new_submission("d2", "c")).await.unwrap();

        let now = Utc::now();
        store
            .update(
                a.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Processing),
                    submitted_at: Some(now - Duration::hours(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                a.submission_id,
                UpdateGuard::status(SubmissionStatus::Processing),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Verified),
                    verified_at: Some(now),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                b.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.success_rate_percent, 50.0);
        assert!((stats.avg_verification_hours.unwrap() - 2.0).abs() < 1e-6);

        let summary = store.device_summary("d1").await.unwrap();
        assert_eq!(summary.total_submissions, 2);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.in_flight, 0);
        assert_eq!(summary.total_verified_energy_kwh, 12.5);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = InMemorySubmissionStore::new();
        let old = store.create(new_submission("d1", "old")).await.unwrap();
        store.create(new_submission("d1", "new")).await.unwrap();
        store
            .backdate(old.submission_id, Utc::now() - Duration::days(120))
            .await;

        let removed = store
            .delete_older_than(Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.all().await.len(), 1);
    }
}
