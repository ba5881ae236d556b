use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::http::auth::AdminGuard;
use crate::server::ServerState;

/// Force an index rebuild regardless of the refresh interval.
pub async fn reload(AdminGuard: AdminGuard, State(state): State<ServerState>) -> impl IntoResponse {
    match state.service.refresh().await {
        Ok(index) => {
            tracing::info!(packages = index.len(), "index.reload.requested");
            (
                StatusCode::OK,
                Json(json!({ "status": "success", "packages": index.len() })),
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "index reload failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "info": err.public_message() })),
            )
        }
    }
}
