//! Domain layer for the energy registry backend.
//!
//! This crate contains:
//! - Domain models (readings, aggregated reports, submission records, readiness)
//! - The telemetry aggregator and the registry submission pipeline
//! - Store and registry traits with in-memory implementations
//! - Domain error types

pub mod error;
pub mod models;
pub mod services;

pub use error::{AggregationError, StoreError, SubmissionError};
