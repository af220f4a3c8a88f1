//! Resubmission of recent retryable failures.

use std::sync::Arc;

use chrono::{Duration, Utc};
use domain::services::{RetrySummary, SubmissionPipeline};
use tracing::info;

use super::scheduler::{Job, JobError, JobFrequency};

pub struct RetryFailedJob {
    pipeline: Arc<SubmissionPipeline>,
    max_age: Duration,
    batch_size: i64,
}

impl RetryFailedJob {
    /// Only failures newer than `max_age_hours` are considered.
    pub fn new(pipeline: Arc<SubmissionPipeline>, max_age_hours: i64, batch_size: i64) -> Self {
        Self {
            pipeline,
            max_age: Duration::hours(max_age_hours.max(1)),
            batch_size,
        }
    }

    pub async fn run(&self) -> Result<RetrySummary, JobError> {
        let since = Utc::now() - self.max_age;
        let summary = self
            .pipeline
            .retry_failed_submissions(since, self.batch_size)
            .await?;
        info!(
            candidates = summary.candidates,
            resubmitted = summary.resubmitted,
            failed_again = summary.failed_again,
            skipped = summary.skipped,
            "Retried failed submissions"
        );
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl Job for RetryFailedJob {
    fn name(&self) -> &'static str {
        "retry_failed_submissions"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Hourly
    }

    async fn execute(&self) -> Result<(), JobError> {
        self.run().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domain::models::{
        ErrorClass, NewSubmission, SubmissionStatus, SubmissionUpdate, UpdateGuard,
    };
    use domain::services::{
        InMemorySubmissionStore, MockRegistryClient, PipelineSettings, RetryPolicy,
        SubmissionStore,
    };

    async fn failed(store: &InMemorySubmissionStore, device: &str, class: ErrorClass) {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let record = store
            .create(NewSubmission {
                device_id: device.to_string(),
                policy_id: "policy-1".to_string(),
                period_start: start,
                period_end: start + Duration::days(1),
                total_energy_kwh: 4.2,
                data_points_count: 1440,
                verification_hash: format!("hash-{}", device),
                payload: serde_json::json!({"device": device}),
            })
            .await
            .unwrap();
        store
            .update(
                record.submission_id,
                UpdateGuard::status(SubmissionStatus::Pending),
                SubmissionUpdate {
                    status: Some(SubmissionStatus::Failed),
                    error_message: Some("registry said no".to_string()),
                    last_error_class: Some(class),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubmits_only_retryable_failures() {
        let registry = Arc::new(MockRegistryClient::new());
        let store = Arc::new(InMemorySubmissionStore::new());
        failed(&store, "ESP32_001", ErrorClass::Transient).await;
        failed(&store, "ESP32_002", ErrorClass::Validation).await;

        let pipeline = Arc::new(SubmissionPipeline::new(
            registry.clone(),
            store.clone(),
            RetryPolicy::immediate(0),
            PipelineSettings::default(),
        ));
        let job = RetryFailedJob::new(pipeline, 24, 100);

        let summary = job.run().await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.resubmitted, 1);
        assert_eq!(registry.create_calls(), 1);

        let second = job.run().await.unwrap();
        assert_eq!(second.resubmitted, 0);
        assert_eq!(registry.create_calls(), 1);
    }

    #[test]
    fn test_max_age_is_at_least_an_hour() {
        let pipeline = Arc::new(SubmissionPipeline::new(
            Arc::new(MockRegistryClient::new()),
            Arc::new(InMemorySubmissionStore::new()),
            RetryPolicy::immediate(0),
            PipelineSettings::default(),
        ));
        let job = RetryFailedJob::new(pipeline, 0, 10);
        assert_eq!(job.max_age, Duration::hours(1));
        assert_eq!(job.frequency(), JobFrequency::Hourly);
    }
}
