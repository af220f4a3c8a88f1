//! Domain services for the energy registry backend.
//!
//! Services contain business logic that operates on domain models.

pub mod aggregator;
pub mod payload;
pub mod reading_store;
pub mod registry;
pub mod retry;
pub mod submission;
pub mod submission_store;

pub use aggregator::{evaluate_readiness, AggregationRules, Aggregator, RejectReason};
pub use payload::build_payload;
pub use reading_store::{InMemoryReadingStore, ReadingStore};
pub use registry::{
    CreatedDocument, DocumentState, DocumentStatus, MockRegistryClient, PolicySummary,
    RegistryClient, RegistryError,
};
pub use retry::{classify_status, RetryPolicy};
pub use submission::{
    PipelineSettings, ResumeSummary, RetrySummary, SubmissionPipeline, TrackingSummary,
};
pub use submission_store::{InMemorySubmissionStore, SubmissionStore};
