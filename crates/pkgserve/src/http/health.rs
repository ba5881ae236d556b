use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use pkgserve_core::RefreshStatus;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::server::ServerState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub packages: usize,
    pub last_refresh: Option<String>,
    pub last_error: Option<String>,
}

impl From<RefreshStatus> for HealthReport {
    fn from(status: RefreshStatus) -> Self {
        let healthy = status.last_refresh.is_some() && status.last_error.is_none();
        let last_refresh = status
            .last_refresh
            .and_then(|ts| OffsetDateTime::from(ts).format(&Rfc3339).ok());
        Self {
            status: if healthy { "ok" } else { "degraded" },
            packages: status.packages,
            last_refresh,
            last_error: status.last_error,
        }
    }
}

pub async fn handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthReport::from(state.service.status()))
}
