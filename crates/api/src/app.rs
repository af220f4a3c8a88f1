use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use domain::services::{
    Aggregator, InMemoryReadingStore, InMemorySubmissionStore, ReadingStore, RegistryClient,
    SubmissionPipeline, SubmissionStore,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::middleware::{metrics_handler, metrics_middleware, request_id};
use crate::routes::{aggregation, health, readings, submissions};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub readings: Arc<dyn ReadingStore>,
    pub aggregator: Arc<Aggregator>,
    pub pipeline: Arc<SubmissionPipeline>,
    /// Absent when running on in-memory stores.
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Wire the aggregator and pipeline over the given stores using `config`.
    pub fn new(
        config: Arc<Config>,
        readings: Arc<dyn ReadingStore>,
        submissions: Arc<dyn SubmissionStore>,
        registry: Arc<dyn RegistryClient>,
        pool: Option<PgPool>,
    ) -> Self {
        let aggregator = Arc::new(
            Aggregator::new(Arc::clone(&readings), config.aggregation_rules())
                .with_thresholds(config.readiness_thresholds()),
        );
        let pipeline = Arc::new(SubmissionPipeline::new(
            registry,
            submissions,
            config.retry_policy(),
            config.pipeline_settings(),
        ));
        Self {
            config,
            readings,
            aggregator,
            pipeline,
            pool,
        }
    }

    /// State backed entirely by in-memory stores.
    pub fn in_memory(config: Config, registry: Arc<dyn RegistryClient>) -> Self {
        Self::new(
            Arc::new(config),
            Arc::new(InMemoryReadingStore::new()),
            Arc::new(InMemorySubmissionStore::new()),
            registry,
            None,
        )
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

pub fn create_app(state: AppState) -> Router {
    let config = Arc::clone(&state.config);

    let api_routes = Router::new()
        .route("/api/v1/readings", post(readings::ingest_reading))
        .route(
            "/api/v1/devices/:device_id/aggregate",
            get(aggregation::aggregate_device),
        )
        .route(
            "/api/v1/devices/:device_id/readiness",
            get(aggregation::device_readiness),
        )
        .route(
            "/api/v1/devices/:device_id/submissions/summary",
            get(submissions::device_summary),
        )
        .route(
            "/api/v1/submissions",
            post(submissions::create_submission).get(submissions::list_submissions),
        )
        .route("/api/v1/submissions/stats", get(submissions::submission_stats))
        .route(
            "/api/v1/submissions/:submission_id",
            get(submissions::get_submission),
        )
        .route(
            "/api/v1/submissions/:submission_id/track",
            post(submissions::track_submission),
        );

    let public_routes = Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/health/ready", get(health::ready))
        .route("/api/health/live", get(health::live))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        // Bottom layers run first.
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .layer(cors_layer(&config.server.cors_origins))
        .with_state(state)
}
