//! Domain models.

pub mod readiness;
pub mod reading;
pub mod report;
pub mod submission;

pub use readiness::{ReadinessCheck, ReadinessResult, ReadinessThresholds};
pub use reading::{IngestReadingRequest, IngestReadingResponse, RawReading};
pub use report::{
    AggregatedEnergyReport, DataQualityMetrics, EnergyMetrics, EnvironmentalMetrics,
    PerformanceMetrics, RegionalCompliance, ReportingWindow,
};
pub use submission::{
    CreateSubmissionRequest, DeviceSubmissionSummary, ErrorClass, NewSubmission,
    SubmissionFilter, SubmissionRecord, SubmissionStats, SubmissionStatus, SubmissionSummary,
    SubmissionUpdate, UpdateGuard,
};
