//! Health check endpoint handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Omitted when the service runs without a database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
    pub registry: RegistryHealth,
    pub scheduler_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseHealth {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// Registry reachability. An unreachable registry degrades but does not fail the check.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryHealth {
    pub reachable: bool,
    pub policies: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Simple status response for liveness/readiness probes.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

async fn database_health(state: &AppState) -> Option<DatabaseHealth> {
    let pool = state.pool.as_ref()?;
    let start = std::time::Instant::now();
    let connected = persistence::db::ping(pool).await.is_ok();
    let latency_ms = start.elapsed().as_millis() as u64;
    Some(DatabaseHealth {
        connected,
        latency_ms: connected.then_some(latency_ms),
    })
}

async fn registry_health(state: &AppState) -> RegistryHealth {
    match state.pipeline.registry().list_policies().await {
        Ok(policies) => RegistryHealth {
            reachable: true,
            policies: Some(policies.len()),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Registry health check failed");
            RegistryHealth {
                reachable: false,
                policies: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Full health check.
///
/// GET /api/health
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let database = database_health(&state).await;
    let healthy = database.as_ref().map(|db| db.connected).unwrap_or(true);
    let registry = registry_health(&state).await;

    let status = match (healthy, registry.reachable) {
        (false, _) => "unhealthy",
        (true, false) => "degraded",
        (true, true) => "healthy",
    };
    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        registry,
        scheduler_enabled: state.config.scheduler.enabled,
    };

    if healthy {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}

/// Liveness probe. 200 while the process is running.
pub async fn live() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe. 503 while the database is unreachable.
pub async fn ready(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    match database_health(&state).await {
        Some(db) if !db.connected => Err(StatusCode::SERVICE_UNAVAILABLE),
        _ => Ok(Json(StatusResponse {
            status: "ready".to_string(),
        })),
    }
}
