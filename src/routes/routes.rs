//! Routes for the image vault.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz` - liveness
//!   - `GET  /readyz`  - readiness (SQLite + optimizer worker)
//!
//! - **Ingress**
//!   - `POST /api/images` - multipart upload, converted and stored
//!
//! - **Gateway**
//!   - `GET  /{namespace}/{filename}` - serve a stored image (HEAD included)

use crate::{
    config::AppConfig,
    handlers::{
        gateway_handlers::serve_virtual_path,
        health_handlers::{healthz, readyz},
        ingest_handlers::convert_image,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and the small text fields next to the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build and return the router.
///
/// The router carries shared state (`AppState`) to all handlers; the
/// ingest body limit follows `config.max_blob_size`.
pub fn routes(config: &AppConfig) -> Router<AppState> {
    let body_limit = config.max_blob_size.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/images",
            post(convert_image).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/{namespace}/{filename}", get(serve_virtual_path))
}
