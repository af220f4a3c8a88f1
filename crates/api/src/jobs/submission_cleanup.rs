//! Submission record retention job.
//!
//! Deletes submission records older than the retention period.

use std::sync::Arc;

use chrono::{Duration, Utc};
use domain::services::SubmissionStore;
use tracing::info;

use super::scheduler::{Job, JobError, JobFrequency};

const DEFAULT_RETENTION_DAYS: i64 = 90;

pub struct SubmissionCleanupJob {
    store: Arc<dyn SubmissionStore>,
    retention_days: i64,
}

impl SubmissionCleanupJob {
    /// Non-positive retention falls back to 90 days.
    pub fn new(store: Arc<dyn SubmissionStore>, retention_days: i64) -> Self {
        let retention_days = if retention_days > 0 {
            retention_days
        } else {
            DEFAULT_RETENTION_DAYS
        };
        Self {
            store,
            retention_days,
        }
    }

    pub async fn run(&self) -> Result<u64, JobError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let deleted = self.store.delete_older_than(cutoff).await?;
        info!(
            deleted,
            retention_days = self.retention_days,
            "Cleaned up old submission records"
        );
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl Job for SubmissionCleanupJob {
    fn name(&self) -> &'static str {
        "submission_cleanup"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Daily
    }

    async fn execute(&self) -> Result<(), JobError> {
        self.run().await.map(|_| ())
    }
}
