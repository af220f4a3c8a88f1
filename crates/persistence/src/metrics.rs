//! Database query timing.

use metrics::histogram;
use std::time::Instant;

/// Record one query's duration under `database_query_duration_seconds{query}`.
pub fn record_query_duration(query_name: &'static str, duration_secs: f64) {
    histogram!("database_query_duration_seconds", "query" => query_name).record(duration_secs);
}

/// Times a single query.
///
/// ```ignore
/// let timer = QueryTimer::new("find_current_submission");
/// let result = sqlx::query_as::<_, SubmissionEntity>(...).fetch_optional(&pool).await;
/// timer.record();
/// result
/// ```
pub struct QueryTimer {
    query_name: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn new(query_name: &'static str) -> Self {
        Self {
            query_name,
            start: Instant::now(),
        }
    }

    pub fn record(self) {
        record_query_duration(self.query_name, self.start.elapsed().as_secs_f64());
    }
}
