use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pkgserve_core::{
    ArchivePayload, PackageError, PackageQuery, PackageRequest, RequestMode, Resolution,
};
use serde::{Deserialize, Serialize};

use crate::server::ServerState;

/// Request body of the package endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub pkg: Option<String>,
}

impl QueryBody {
    fn into_request(self) -> Result<PackageRequest, PackageError> {
        let action = non_empty(self.action, "action")?;
        let pkg = non_empty(self.pkg, "pkg")?;
        let mode = action.parse::<RequestMode>()?;
        Ok(PackageRequest::new(mode, PackageQuery::parse(&pkg)))
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, PackageError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(PackageError::invalid_request(format!(
            "`{field}` must be a non-empty string"
        ))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

/// `{"status": ..., "info": ...}` body shared by every JSON reply.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub status: Outcome,
    pub info: &'a str,
}

impl<'a> Envelope<'a> {
    pub fn success(info: &'a str) -> Self {
        Self {
            status: Outcome::Success,
            info,
        }
    }

    pub fn error(info: &'a str) -> Self {
        Self {
            status: Outcome::Error,
            info,
        }
    }
}

/// HTTP rendering of a [`PackageError`].
#[derive(Debug)]
pub struct ApiError(pub PackageError);

impl From<PackageError> for ApiError {
    fn from(err: PackageError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PackageError::InvalidRequest { .. } | PackageError::InvalidPackageName { .. } => {
                StatusCode::BAD_REQUEST
            }
            PackageError::PackageNotFound { .. } | PackageError::VersionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            PackageError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "package request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "package request rejected");
        }
        (status, Json(Envelope::error(self.0.public_message()))).into_response()
    }
}

/// `GET <path>` with a JSON body naming an action and a package.
pub async fn query(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !is_json(&headers) {
        return Err(PackageError::invalid_request("content type is not application/json").into());
    }
    let body: QueryBody = serde_json::from_slice(&body)
        .map_err(|err| PackageError::invalid_request(format!("malformed body: {err}")))?;
    let request = body.into_request()?;

    match state.service.resolve(&request).await? {
        Resolution::Latest(reference) => {
            Ok(Json(Envelope::success(&reference.version)).into_response())
        }
        Resolution::Archive(payload) => Ok(archive_response(payload)),
    }
}

fn archive_response(payload: ArchivePayload) -> Response {
    let content_type = payload.content_type();
    let disposition = format!("attachment; filename={}", payload.filename());
    let mut response = payload.bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    response
}

/// Media type `application/json`, parameters such as `charset` allowed.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}
