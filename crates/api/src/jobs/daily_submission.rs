//! Daily registry submission job.
//!
//! Once per UTC day, after the configured hour, aggregates the previous day for
//! every device that reported, and submits the reports that pass readiness.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Timelike, Utc};
use domain::models::ReportingWindow;
use domain::services::{evaluate_readiness, Aggregator, ReadingStore, SubmissionPipeline};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::scheduler::{Job, JobError, JobFrequency};
use crate::config::SchedulerConfig;

/// Per-run counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyRunSummary {
    pub date: Option<NaiveDate>,
    pub queued: u32,
    pub submitted: u32,
    pub skipped_not_ready: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceOutcome {
    Submitted,
    NotReady,
    Failed,
}

pub struct DailySubmissionJob {
    aggregator: Arc<Aggregator>,
    pipeline: Arc<SubmissionPipeline>,
    readings: Arc<dyn ReadingStore>,
    settings: SchedulerConfig,
    last_completed: Mutex<Option<NaiveDate>>,
}

impl DailySubmissionJob {
    pub fn new(
        aggregator: Arc<Aggregator>,
        pipeline: Arc<SubmissionPipeline>,
        readings: Arc<dyn ReadingStore>,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            aggregator,
            pipeline,
            readings,
            settings,
            last_completed: Mutex::new(None),
        }
    }

    /// Aggregate and submit every selected device for one UTC day.
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<DailyRunSummary, JobError> {
        let window = ReportingWindow::day(date);
        let devices: Vec<String> = self
            .readings
            .devices_with_readings(window.start(), window.end())
            .await?
            .into_iter()
            .filter(|d| self.settings.device_selected(d))
            .collect();

        let mut summary = DailyRunSummary {
            date: Some(date),
            queued: devices.len() as u32,
            ..Default::default()
        };
        info!(%date, devices = summary.queued, "Starting daily submission run");

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_submissions.max(1)));
        let policy_id: Arc<str> = Arc::from(self.settings.default_policy_id.as_str());
        let mut tasks = JoinSet::new();

        for device_id in devices {
            let permits = Arc::clone(&permits);
            let aggregator = Arc::clone(&self.aggregator);
            let pipeline = Arc::clone(&self.pipeline);
            let policy_id = Arc::clone(&policy_id);

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return DeviceOutcome::Failed;
                };
                submit_device(&aggregator, &pipeline, &device_id, &window, &policy_id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(DeviceOutcome::Submitted) => summary.submitted += 1,
                Ok(DeviceOutcome::NotReady) => summary.skipped_not_ready += 1,
                Ok(DeviceOutcome::Failed) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Device submission task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            %date,
            queued = summary.queued,
            submitted = summary.submitted,
            skipped_not_ready = summary.skipped_not_ready,
            failed = summary.failed,
            "Daily submission run finished"
        );
        Ok(summary)
    }
}

async fn submit_device(
    aggregator: &Aggregator,
    pipeline: &SubmissionPipeline,
    device_id: &str,
    window: &ReportingWindow,
    policy_id: &str,
) -> DeviceOutcome {
    let report = match aggregator.aggregate_window(device_id, window).await {
        Ok(report) => report,
        Err(e) if e.is_recoverable() => {
            info!(device_id, reason = %e, "Skipping device without usable data");
            return DeviceOutcome::NotReady;
        }
        Err(e) => {
            warn!(device_id, error = %e, "Aggregation failed");
            return DeviceOutcome::Failed;
        }
    };

    let readiness = evaluate_readiness(&report, aggregator.thresholds());
    if !readiness.registry_ready {
        info!(
            device_id,
            failed_checks = ?readiness.failed_checks(),
            "Report not ready for registry"
        );
        return DeviceOutcome::NotReady;
    }

    match pipeline.submit_report(&report, policy_id).await {
        Ok(record) => {
            info!(
                device_id,
                submission_id = %record.submission_id,
                status = %record.status,
                "Report submitted"
            );
            DeviceOutcome::Submitted
        }
        Err(e) => {
            warn!(device_id, error = %e, "Report submission failed");
            DeviceOutcome::Failed
        }
    }
}

#[async_trait::async_trait]
impl Job for DailySubmissionJob {
    fn name(&self) -> &'static str {
        "daily_submission"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(15)
    }

    async fn execute(&self) -> Result<(), JobError> {
        let now = Utc::now();
        if now.hour() < self.settings.daily_submission_hour {
            return Ok(());
        }
        let target = now.date_naive() - Duration::days(1);

        let mut last = self.last_completed.lock().await;
        if *last == Some(target) {
            return Ok(());
        }
        self.run_for_date(target).await?;
        *last = Some(target);
        Ok(())
    }
}
