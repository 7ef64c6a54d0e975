use crate::hardening::CircuitState;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub storage: String,
    pub sessions: usize,
    pub providers: BTreeMap<String, CircuitState>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Open circuits are reported but do not make the service unready.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;
    if let Err(e) = sqlx::query("SELECT 1").fetch_one(&state.db).await {
        tracing::error!("Readiness check: DB error: {}", e);
        db_ok = false;
    }

    let storage_ok = state.storage.is_writable().await;
    if !storage_ok {
        tracing::error!("Readiness check: storage dir not writable");
    }

    let ready = db_ok && storage_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            storage: if storage_ok { "ok" } else { "error" }.to_string(),
            sessions: state.sessions.len().await,
            providers: state.providers.circuit_states().await.into_iter().collect(),
        }),
    )
}
