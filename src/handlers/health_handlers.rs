//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the optimizer worker

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe - always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Counts stored objects (exercises the SQLite pool).
/// 2. Reads the optimizer liveness flag from the pipeline context.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let (sqlite_ok, sqlite_error, stored) = match state.store.count().await {
        Ok(count) => (true, None, Some(count)),
        Err(e) => (false, Some(format!("error: {}", e)), None),
    };

    let optimizer_ok = state.ctx.optimizer_alive();
    let optimizer_error = (!optimizer_ok).then(|| "worker not running".to_string());

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_ok,
            error: sqlite_error,
        },
    );
    checks.insert(
        "optimizer",
        CheckStatus {
            ok: optimizer_ok,
            error: optimizer_error,
        },
    );

    let overall_ok = sqlite_ok && optimizer_ok;
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        stored_objects: stored,
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    stored_objects: Option<u64>,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
