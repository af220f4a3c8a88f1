//! Shared utilities and common types for the energy registry backend.
//!
//! This crate provides common functionality used across all other crates:
//! - Canonical SHA-256 fingerprints for report verification
//! - Cursor pagination helpers
//! - Telemetry field validators and tolerance bands
//! - Registry token inspection

pub mod crypto;
pub mod jwt;
pub mod pagination;
pub mod validation;
