//! Domain error types.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorClass;
use crate::services::registry::RegistryError;

/// Errors raised by reading and submission stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("A current submission already exists: {0}")]
    Duplicate(String),

    #[error("Submission {0} is in a terminal state")]
    Terminal(Uuid),

    #[error("Submission {0} changed concurrently")]
    Conflict(Uuid),

    #[error("Illegal submission update: {0}")]
    InvalidTransition(String),

    #[error("Stored data is invalid: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the telemetry aggregator.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No readings for device {device_id} between {start} and {end}")]
    NoData {
        device_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("All {total} readings for device {device_id} were rejected by validation")]
    InsufficientData { device_id: String, total: usize },

    #[error("Reading store error: {0}")]
    Storage(#[from] StoreError),
}

impl AggregationError {
    /// Whether waiting for more data could make a later call succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AggregationError::NoData { .. } | AggregationError::InsufficientData { .. }
        )
    }
}

/// Errors raised by the registry submission pipeline.
///
/// Registry failures are only returned after the FAILED state has been persisted,
/// so `submission_id` always points at a durable record.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Submission not found: {0}")]
    NotFound(Uuid),

    #[error("Submission {submission_id} failed after {attempts} attempt(s), retries exhausted: {message}")]
    RetryableExhausted {
        submission_id: Uuid,
        attempts: u32,
        class: ErrorClass,
        message: String,
    },

    #[error("Submission {submission_id} rejected by registry ({class}): {message}")]
    NonRetryable {
        submission_id: Uuid,
        class: ErrorClass,
        message: String,
    },

    #[error("Registry unreachable while tracking submission {submission_id}: {source}")]
    RegistryUnavailable {
        submission_id: Uuid,
        #[source]
        source: RegistryError,
    },

    #[error("Submission {0} is inconsistent: {1}")]
    InvalidState(Uuid, String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Submission store error: {0}")]
    Storage(#[from] StoreError),
}

impl SubmissionError {
    /// The submission record this error refers to, when one was persisted.
    pub fn submission_id(&self) -> Option<Uuid> {
        match self {
            SubmissionError::NotFound(id) | SubmissionError::InvalidState(id, _) => Some(*id),
            SubmissionError::RetryableExhausted { submission_id, .. }
            | SubmissionError::NonRetryable { submission_id, .. }
            | SubmissionError::RegistryUnavailable { submission_id, .. } => Some(*submission_id),
            _ => None,
        }
    }

    /// True when the failure could succeed on a later run without data changes.
    pub fn may_succeed_later(&self) -> bool {
        matches!(
            self,
            SubmissionError::RetryableExhausted { .. }
                | SubmissionError::RegistryUnavailable { .. }
                | SubmissionError::Storage(_)
        )
    }
}
