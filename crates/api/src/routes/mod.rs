//! HTTP route handlers.

pub mod aggregation;
pub mod health;
pub mod readings;
pub mod submissions;
