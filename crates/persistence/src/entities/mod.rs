//! Database entity definitions.
//!
//! Entities map directly to database tables.

pub mod sensor_reading;
pub mod submission;

pub use sensor_reading::SensorReadingEntity;
pub use submission::{DeviceSummaryRow, SubmissionEntity, SubmissionStatsRow};
