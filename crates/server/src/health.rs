use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use ringback_db::DbPool;
use serde::Serialize;
use tracing::warn;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db: &'static str,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: "ok", db: "up" })),
        Err(error) => {
            warn!(
                event_name = "system.health.degraded",
                correlation_id = "health",
                error = %error,
                "database health probe failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: "degraded", db: "down" }),
            )
        }
    }
}
