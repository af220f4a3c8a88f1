//! HTTP middleware components.

pub mod logging;
pub mod metrics;
pub mod request_id;

pub use metrics::{init_metrics, metrics_handler, metrics_middleware};
pub use request_id::{request_id, RequestId, REQUEST_ID_HEADER};
