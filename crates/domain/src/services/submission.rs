//! Registry submission pipeline.
//!
//! Drives one aggregated report through the submission state machine:
//!
//! ```text
//! PENDING ──create ok──▶ PROCESSING ──verified──▶ VERIFIED
//!    │                        │
//!    └──────── failure ───────┴──────────────────▶ FAILED
//! ```
//!
//! Each create attempt is claimed in the store first (a compare-and-set on status
//! and `retry_count`), so two drivers never call the registry for the same attempt.
//! A claim doubles as a lease: a PENDING record whose `updated_at` is older than
//! [`SubmissionPipeline::pending_lease`] has lost its driver (crash, cancelled
//! request) and is picked up again by [`SubmissionPipeline::submit_report`],
//! [`SubmissionPipeline::track_pending_documents`] or
//! [`SubmissionPipeline::resume_incomplete`].
//!
//! A crash after the registry accepted a create call but before PROCESSING was
//! persisted leaves the record PENDING, and re-driving it creates a second registry
//! document. The registry offers no idempotency key to close that gap.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{StoreError, SubmissionError};
use crate::models::{
    AggregatedEnergyReport, ErrorClass, NewSubmission, SubmissionFilter, SubmissionRecord,
    SubmissionStatus, SubmissionUpdate, UpdateGuard,
};
use crate::services::payload::build_payload;
use crate::services::registry::{DocumentState, RegistryClient, RegistryError};
use crate::services::retry::RetryPolicy;
use crate::services::submission_store::SubmissionStore;

/// Tunables for the pipeline that are not part of the retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Upper bound on any single registry call.
    pub call_timeout: Duration,
    /// How long a record may stay PROCESSING before it is failed.
    pub max_processing_age: chrono::Duration,
    /// FAILED records per (device, period, hash) after which automatic resubmission stops.
    pub max_resubmissions: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_processing_age: chrono::Duration::hours(72),
            max_resubmissions: 3,
        }
    }
}

/// Slack added to the PENDING lease on top of one call and one backoff.
const PENDING_LEASE_MARGIN_SECS: i64 = 60;

/// Counts from [`SubmissionPipeline::track_pending_documents`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingSummary {
    /// Abandoned PENDING records driven again.
    pub pending_resumed: u32,
    pub polled: u32,
    pub verified: u32,
    pub failed: u32,
    pub still_processing: u32,
    pub errors: u32,
}

/// Counts from [`SubmissionPipeline::resume_incomplete`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeSummary {
    pub pending_resumed: u32,
    pub pending_failed: u32,
    pub processing_polled: u32,
}

/// Counts from [`SubmissionPipeline::retry_failed_submissions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub candidates: u32,
    pub resubmitted: u32,
    pub failed_again: u32,
    pub skipped: u32,
}

pub struct SubmissionPipeline {
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn SubmissionStore>,
    retry: RetryPolicy,
    settings: PipelineSettings,
}

impl SubmissionPipeline {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn SubmissionStore>,
        retry: RetryPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            store,
            retry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn RegistryClient> {
        &self.registry
    }

    /// Longest a live driver leaves a PENDING record untouched.
    ///
    /// A driver writes the record before and after every registry call, so the
    /// widest gap is one call plus one backoff.
    pub fn pending_lease(&self) -> chrono::Duration {
        let jitter = if self.retry.jitter_enabled {
            self.retry.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let backoff =
            Duration::try_from_secs_f64(self.retry.max_delay.as_secs_f64() * (1.0 + jitter))
                .unwrap_or(Duration::MAX);
        let margin = chrono::Duration::seconds(PENDING_LEASE_MARGIN_SECS);
        self.settings
            .call_timeout
            .checked_add(backoff)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| d.checked_add(&margin))
            .unwrap_or(chrono::Duration::MAX)
    }

    /// True when `record` is PENDING and its driver has gone quiet past the lease.
    pub fn is_abandoned(&self, record: &SubmissionRecord) -> bool {
        record.status == SubmissionStatus::Pending
            && Utc::now() - record.updated_at > self.pending_lease()
    }

    /// Submit a report to the registry under `policy_id`.
    ///
    /// If a non-FAILED record already exists for the same device, period and
    /// verification hash, that record is returned and the registry is not called,
    /// unless it is a PENDING record abandoned by its driver, which is driven again.
    /// Registry failures are persisted as FAILED before the error is returned.
    #[tracing::instrument(skip(self, report), fields(device_id = %report.device_id))]
    pub async fn submit_report(
        &self,
        report: &AggregatedEnergyReport,
        policy_id: &str,
    ) -> Result<SubmissionRecord, SubmissionError> {
        let policy_id = policy_id.trim();
        if policy_id.is_empty() {
            return Err(SubmissionError::InvalidArgument(
                "policy_id must not be empty".to_string(),
            ));
        }
        if report.verification_hash.is_empty() {
            return Err(SubmissionError::InvalidArgument(
                "report has no verification hash".to_string(),
            ));
        }

        if let Some(existing) = self.current_record(report).await? {
            if self.is_abandoned(&existing) {
                tracing::info!(
                    submission_id = %existing.submission_id,
                    updated_at = %existing.updated_at,
                    "Resuming abandoned submission"
                );
                return self.drive_create(existing).await;
            }
            tracing::info!(
                submission_id = %existing.submission_id,
                status = %existing.status,
                "Report already submitted, returning existing record"
            );
            counter!("registry_submissions_total", "outcome" => "duplicate").increment(1);
            return Ok(existing);
        }

        let payload = build_payload(report)?;
        let new = NewSubmission::from_report(report, policy_id, payload);
        let record = match self.store.create(new).await {
            Ok(record) => record,
            // Lost a race with a concurrent submission of the same report.
            Err(StoreError::Duplicate(key)) => {
                return match self.current_record(report).await? {
                    Some(existing) => {
                        counter!("registry_submissions_total", "outcome" => "duplicate")
                            .increment(1);
                        Ok(existing)
                    }
                    None => Err(StoreError::Duplicate(key).into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            submission_id = %record.submission_id,
            policy_id = %policy_id,
            "Created submission record"
        );
        self.drive_create(record).await
    }

    async fn current_record(
        &self,
        report: &AggregatedEnergyReport,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        self.store
            .find_by(
                &report.device_id,
                report.period_start,
                report.period_end,
                &report.verification_hash,
            )
            .await
    }

    /// Run the create-document retry loop for a PENDING record.
    ///
    /// Every attempt is claimed in the store before the registry is called, and
    /// `retry_count` keeps counting across resumptions. When another driver holds
    /// the record, the stored record is returned without calling the registry.
    pub async fn drive_create(
        &self,
        record: SubmissionRecord,
    ) -> Result<SubmissionRecord, SubmissionError> {
        if record.status != SubmissionStatus::Pending {
            return Err(SubmissionError::InvalidState(
                record.submission_id,
                format!("expected PENDING, found {}", record.status),
            ));
        }

        let id = record.submission_id;
        let mut current = record;
        let mut hint: Option<Duration> = None;
        let mut last_error = RegistryError::transient("no attempt made");
        let mut attempts: u32 = 0;

        for attempt in 0..self.retry.max_attempts() {
            let delay = {
                let mut rng = rand::thread_rng();
                self.retry.delay_for(attempt, &mut rng)
            };
            let delay = self.retry.apply_hint(delay, hint.take());
            if !delay.is_zero() {
                tracing::debug!(submission_id = %id, attempt, ?delay, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }

            let claim = SubmissionUpdate {
                retry_count: Some(current.retry_count + 1),
                ..Default::default()
            };
            current = match self.guarded_update(&current, claim).await? {
                Some(claimed) => claimed,
                None => return self.handed_off(id).await,
            };
            attempts = attempt + 1;

            let outcome = self
                .bounded(self.registry.create_document(&current.policy_id, &current.payload))
                .await;

            match outcome {
                Ok(created) => {
                    counter!("registry_attempts_total", "class" => "success").increment(1);
                    counter!("registry_submissions_total", "outcome" => "processing")
                        .increment(1);
                    tracing::info!(
                        submission_id = %id,
                        document_id = %created.document_id,
                        attempts,
                        "Registry accepted document"
                    );
                    let update = SubmissionUpdate {
                        status: Some(SubmissionStatus::Processing),
                        registry_document_id: Some(created.document_id),
                        registry_response: Some(created.response),
                        submitted_at: Some(Utc::now()),
                        ..Default::default()
                    };
                    return match self.guarded_update(&current, update).await? {
                        Some(record) => Ok(record),
                        None => {
                            tracing::warn!(
                                submission_id = %id,
                                "Record taken over while the registry call was in flight"
                            );
                            self.handed_off(id).await
                        }
                    };
                }
                Err(err) => {
                    counter!("registry_attempts_total", "class" => err.class.as_str())
                        .increment(1);
                    tracing::warn!(
                        submission_id = %id,
                        attempt = attempts,
                        class = %err.class,
                        error = %err.message,
                        "Registry create call failed"
                    );

                    if !err.is_retryable() {
                        self.mark_failed(&current, err.class, &err.to_string()).await?;
                        return Err(SubmissionError::NonRetryable {
                            submission_id: id,
                            class: err.class,
                            message: err.to_string(),
                        });
                    }

                    let update = SubmissionUpdate {
                        last_error_class: Some(err.class),
                        ..Default::default()
                    };
                    current = match self.guarded_update(&current, update).await? {
                        Some(record) => record,
                        None => return self.handed_off(id).await,
                    };
                    hint = err.retry_after;
                    last_error = err;
                }
            }
        }

        let message = format!(
            "retries exhausted after {} attempt(s): {}",
            attempts, last_error
        );
        self.mark_failed(&current, last_error.class, &message).await?;
        Err(SubmissionError::RetryableExhausted {
            submission_id: id,
            attempts,
            class: last_error.class,
            message,
        })
    }

    /// Update a PENDING record this driver holds. `None` means another driver took
    /// it over or finished it.
    async fn guarded_update(
        &self,
        held: &SubmissionRecord,
        update: SubmissionUpdate,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let guard = UpdateGuard::attempt(SubmissionStatus::Pending, held.retry_count);
        match self.store.update(held.submission_id, guard, update).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Conflict(_)) | Err(StoreError::Terminal(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn handed_off(&self, id: Uuid) -> Result<SubmissionRecord, SubmissionError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(SubmissionError::NotFound(id))?;
        tracing::info!(
            submission_id = %id,
            status = %record.status,
            retry_count = record.retry_count,
            "Submission is driven elsewhere"
        );
        counter!("registry_submissions_total", "outcome" => "handed_off").increment(1);
        Ok(record)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RegistryError>>,
    ) -> Result<T, RegistryError> {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::transient(format!(
                "registry call timed out after {:?}",
                self.settings.call_timeout
            ))),
        }
    }

    async fn mark_failed(
        &self,
        held: &SubmissionRecord,
        class: ErrorClass,
        message: &str,
    ) -> Result<SubmissionRecord, SubmissionError> {
        let update = SubmissionUpdate {
            status: Some(SubmissionStatus::Failed),
            error_message: Some(message.to_string()),
            last_error_class: Some(class),
            ..Default::default()
        };
        match self.guarded_update(held, update).await? {
            Some(record) => {
                counter!("registry_submissions_total", "outcome" => "failed").increment(1);
                Ok(record)
            }
            None => self.handed_off(held.submission_id).await,
        }
    }

    /// Apply a terminal update to a PROCESSING record, tolerating a concurrent
    /// tracker that got there first.
    async fn finish(
        &self,
        id: Uuid,
        update: SubmissionUpdate,
    ) -> Result<SubmissionRecord, SubmissionError> {
        let guard = UpdateGuard::status(SubmissionStatus::Processing);
        match self.store.update(id, guard, update).await {
            Ok(record) => Ok(record),
            Err(StoreError::Terminal(_)) | Err(StoreError::Conflict(_)) => self
                .store
                .get(id)
                .await?
                .ok_or(SubmissionError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the registry once for a PROCESSING submission and apply the result.
    ///
    /// An abandoned PENDING record is driven again. Terminal records and PENDING
    /// records that still have a live driver are returned unchanged, so repeated
    /// calls are safe.
    #[tracing::instrument(skip(self))]
    pub async fn track_submission_progress(
        &self,
        submission_id: Uuid,
    ) -> Result<SubmissionRecord, SubmissionError> {
        let record = self
            .store
            .get(submission_id)
            .await?
            .ok_or(SubmissionError::NotFound(submission_id))?;

        if self.is_abandoned(&record) {
            return self.drive_create(record).await;
        }
        if record.status != SubmissionStatus::Processing {
            return Ok(record);
        }
        let document_id = record.registry_document_id.clone().ok_or_else(|| {
            SubmissionError::InvalidState(
                submission_id,
                "PROCESSING without a registry document id".to_string(),
            )
        })?;

        let age = Utc::now() - record.submitted_at.unwrap_or(record.created_at);
        let timed_out = age > self.settings.max_processing_age;

        let status = match self
            .bounded(
                self.registry
                    .get_document_status(&document_id, &record.policy_id),
            )
            .await
        {
            Ok(status) => status,
            Err(err) if err.is_retryable() && !timed_out => {
                tracing::warn!(
                    submission_id = %submission_id,
                    error = %err,
                    "Status poll failed, will retry later"
                );
                return Err(SubmissionError::RegistryUnavailable {
                    submission_id,
                    source: err,
                });
            }
            Err(err) if err.is_retryable() => {
                return self.fail_timed_out(submission_id, &record).await;
            }
            Err(err) => {
                counter!("registry_submissions_total", "outcome" => "failed").increment(1);
                return self
                    .finish(
                        submission_id,
                        SubmissionUpdate {
                            status: Some(SubmissionStatus::Failed),
                            error_message: Some(format!("status poll failed: {}", err)),
                            last_error_class: Some(err.class),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        };

        match status.state {
            DocumentState::Verified => {
                counter!("registry_submissions_total", "outcome" => "verified").increment(1);
                tracing::info!(
                    submission_id = %submission_id,
                    document_id = %document_id,
                    "Registry verified document"
                );
                self.finish(
                    submission_id,
                    SubmissionUpdate {
                        status: Some(SubmissionStatus::Verified),
                        verified_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
            }
            DocumentState::Rejected => {
                counter!("registry_submissions_total", "outcome" => "failed").increment(1);
                tracing::warn!(
                    submission_id = %submission_id,
                    raw_status = %status.raw_status,
                    "Registry rejected document"
                );
                self.finish(
                    submission_id,
                    SubmissionUpdate {
                        status: Some(SubmissionStatus::Failed),
                        error_message: Some(format!(
                            "registry rejected document with status {}",
                            status.raw_status
                        )),
                        last_error_class: Some(ErrorClass::Validation),
                        ..Default::default()
                    },
                )
                .await
            }
            DocumentState::Submitted | DocumentState::Processing if timed_out => {
                self.fail_timed_out(submission_id, &record).await
            }
            DocumentState::Submitted | DocumentState::Processing => Ok(record),
        }
    }

    async fn fail_timed_out(
        &self,
        submission_id: Uuid,
        record: &SubmissionRecord,
    ) -> Result<SubmissionRecord, SubmissionError> {
        counter!("registry_submissions_total", "outcome" => "failed").increment(1);
        tracing::warn!(
            submission_id = %submission_id,
            submitted_at = ?record.submitted_at,
            "Verification timed out"
        );
        self.finish(
            submission_id,
            SubmissionUpdate {
                status: Some(SubmissionStatus::Failed),
                error_message: Some("verification timed out".to_string()),
                last_error_class: Some(ErrorClass::Transient),
                ..Default::default()
            },
        )
        .await
    }

    /// Drive abandoned PENDING records again, then poll every PROCESSING record once.
    /// Storage failures abort the run.
    pub async fn track_pending_documents(
        &self,
        limit: i64,
    ) -> Result<TrackingSummary, SubmissionError> {
        let (pending_resumed, _) = self.resume_abandoned(limit).await?;
        let mut summary = self.poll_processing(limit).await?;
        summary.pending_resumed = pending_resumed;
        Ok(summary)
    }

    /// Returns (resumed, failed) counts.
    async fn resume_abandoned(&self, limit: i64) -> Result<(u32, u32), SubmissionError> {
        let pending = self
            .store
            .list_by_status(SubmissionStatus::Pending, limit)
            .await?;
        let (mut resumed, mut failed) = (0, 0);

        for record in pending.into_iter().filter(|r| self.is_abandoned(r)) {
            let id = record.submission_id;
            tracing::info!(
                submission_id = %id,
                updated_at = %record.updated_at,
                "Resuming abandoned submission"
            );
            match self.drive_create(record).await {
                Ok(_) => resumed += 1,
                Err(SubmissionError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(submission_id = %id, error = %e, "Resumed submission failed");
                    failed += 1;
                }
            }
        }
        Ok((resumed, failed))
    }

    async fn poll_processing(&self, limit: i64) -> Result<TrackingSummary, SubmissionError> {
        let processing = self
            .store
            .list_by_status(SubmissionStatus::Processing, limit)
            .await?;
        let mut summary = TrackingSummary::default();

        for record in processing {
            summary.polled += 1;
            match self.track_submission_progress(record.submission_id).await {
                Ok(r) => match r.status {
                    SubmissionStatus::Verified => summary.verified += 1,
                    SubmissionStatus::Failed => summary.failed += 1,
                    _ => summary.still_processing += 1,
                },
                Err(SubmissionError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        submission_id = %record.submission_id,
                        error = %e,
                        "Failed to track submission"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Continue every abandoned PENDING record and poll every PROCESSING record
    /// left behind by a previous run.
    ///
    /// PENDING records still inside their lease belong to a live driver and are
    /// left to the progress tracking job.
    pub async fn resume_incomplete(&self, limit: i64) -> Result<ResumeSummary, SubmissionError> {
        let (pending_resumed, pending_failed) = self.resume_abandoned(limit).await?;
        let tracked = self.poll_processing(limit).await?;
        let summary = ResumeSummary {
            pending_resumed,
            pending_failed,
            processing_polled: tracked.polled,
        };

        tracing::info!(
            pending_resumed = summary.pending_resumed,
            pending_failed = summary.pending_failed,
            processing_polled = summary.processing_polled,
            "Resumed incomplete submissions"
        );
        Ok(summary)
    }

    /// Resubmit recent FAILED records whose last error was retryable.
    ///
    /// A (device, period, hash) is skipped when it already has a current record
    /// or has failed `max_resubmissions` times.
    pub async fn retry_failed_submissions(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<RetrySummary, SubmissionError> {
        let candidates = self.store.list_retryable_failures(since, limit).await?;
        let mut summary = RetrySummary {
            candidates: candidates.len() as u32,
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for failed in candidates {
            let key = (
                failed.device_id.clone(),
                failed.period_start,
                failed.period_end,
                failed.verification_hash.clone(),
            );
            if !seen.insert(key) {
                summary.skipped += 1;
                continue;
            }

            let current = self
                .store
                .find_by(
                    &failed.device_id,
                    failed.period_start,
                    failed.period_end,
                    &failed.verification_hash,
                )
                .await?;
            if current.is_some() || self.failure_count(&failed).await? >= self.settings.max_resubmissions {
                summary.skipped += 1;
                continue;
            }

            let record = match self.store.create(NewSubmission::from_failed(&failed)).await {
                Ok(record) => record,
                Err(StoreError::Duplicate(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            tracing::info!(
                previous = %failed.submission_id,
                submission_id = %record.submission_id,
                "Resubmitting failed report"
            );

            match self.drive_create(record).await {
                Ok(_) => summary.resubmitted += 1,
                Err(SubmissionError::Storage(e)) => return Err(e.into()),
                Err(_) => summary.failed_again += 1,
            }
        }
        Ok(summary)
    }

    async fn failure_count(&self, record: &SubmissionRecord) -> Result<u32, StoreError> {
        let filter = SubmissionFilter {
            device_id: Some(record.device_id.clone()),
            policy_id: None,
            status: Some(SubmissionStatus::Failed),
            period_from: Some(record.period_start),
            period_to: Some(record.period_end),
        };
        let page = self
            .store
            .list(&filter, None, shared::pagination::MAX_PAGE_SIZE)
            .await?;
        Ok(page
            .items
            .iter()
            .filter(|r| {
                r.period_start == record.period_start
                    && r.period_end == record.period_end
                    && r.verification_hash == record.verification_hash
            })
            .count() as u32)
    }
}
