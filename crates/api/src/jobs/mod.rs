//! Background job scheduler and job implementations.

mod daily_submission;
mod progress_tracking;
mod retry_failed;
mod scheduler;
mod submission_cleanup;

pub use daily_submission::{DailyRunSummary, DailySubmissionJob};
pub use progress_tracking::ProgressTrackingJob;
pub use retry_failed::RetryFailedJob;
pub use scheduler::{run_once, Job, JobError, JobFrequency, JobScheduler};
pub use submission_cleanup::SubmissionCleanupJob;
