//! Verification progress polling job.
//!
//! Polls the registry for every PROCESSING submission until it is verified,
//! rejected, or times out. PENDING submissions abandoned by their driver are
//! driven again first.

use std::sync::Arc;

use domain::services::{SubmissionPipeline, TrackingSummary};
use tracing::info;

use super::scheduler::{Job, JobError, JobFrequency};

pub struct ProgressTrackingJob {
    pipeline: Arc<SubmissionPipeline>,
    interval_minutes: u64,
    batch_size: i64,
}

impl ProgressTrackingJob {
    pub fn new(pipeline: Arc<SubmissionPipeline>, interval_minutes: u64, batch_size: i64) -> Self {
        Self {
            pipeline,
            interval_minutes,
            batch_size,
        }
    }

    pub async fn run(&self) -> Result<TrackingSummary, JobError> {
        let summary = self
            .pipeline
            .track_pending_documents(self.batch_size)
            .await?;
        if summary.polled > 0 || summary.pending_resumed > 0 {
            info!(
                pending_resumed = summary.pending_resumed,
                polled = summary.polled,
                verified = summary.verified,
                failed = summary.failed,
                still_processing = summary.still_processing,
                errors = summary.errors,
                "Polled registry verification status"
            );
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl Job for ProgressTrackingJob {
    fn name(&self) -> &'static str {
        "progress_tracking"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> Result<(), JobError> {
        self.run().await.map(|_| ())
    }
}
