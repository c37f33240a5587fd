use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// Liveness plus live client and resource counts.
pub(crate) async fn healthz(State(state): State<AppState>) -> Response {
    match state.hub().snapshot().await {
        Ok(snapshot) => Json(json!({
            "ok": true,
            "clients": snapshot.clients.len(),
            "resources": snapshot.resources.len(),
        }))
        .into_response(),
        Err(err) => {
            warn!(%err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
