use std::net::SocketAddr;

use axum::Json;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde_json::json;
use thiserror::Error;

use crate::server::ServerState;

/// Environment variable holding the admin bearer token.
pub const ADMIN_TOKEN_ENV: &str = "PKGSERVE_ADMIN_TOKEN";

/// Access policy for `/admin` routes: bearer token when configured,
/// loopback peers only otherwise.
#[derive(Clone, Default)]
pub struct AdminAuth {
    token: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminDenied {
    #[error("admin token required")]
    MissingToken,
    #[error("admin token rejected")]
    BadToken,
    #[error("admin access restricted to loopback peers")]
    RemotePeer,
}

impl AdminDenied {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::BadToken => StatusCode::UNAUTHORIZED,
            Self::RemotePeer => StatusCode::FORBIDDEN,
        }
    }
}

impl AdminAuth {
    pub fn from_env() -> Self {
        Self::new(std::env::var(ADMIN_TOKEN_ENV).ok())
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self::new(Some(token.into()))
    }

    fn new(token: Option<String>) -> Self {
        let token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self { token }
    }

    pub fn authorize(&self, peer: SocketAddr, bearer: Option<&str>) -> Result<(), AdminDenied> {
        match &self.token {
            Some(expected) => {
                let token = bearer.ok_or(AdminDenied::MissingToken)?;
                if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
                    Ok(())
                } else {
                    Err(AdminDenied::BadToken)
                }
            }
            None if peer.ip().is_loopback() => Ok(()),
            None => Err(AdminDenied::RemotePeer),
        }
    }
}

/// Extractor that rejects requests failing [`AdminAuth::authorize`].
pub struct AdminGuard;

impl<S> FromRequestParts<S> for AdminGuard
where
    ServerState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let admin = ServerState::from_ref(state).admin;
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let bearer = extract_bearer(parts);

        async move {
            let peer = peer.ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "info": "connect info unavailable" })),
            ))?;
            admin.authorize(peer, bearer.as_deref()).map_err(|denied| {
                tracing::warn!(%peer, reason = %denied, "admin request denied");
                (
                    denied.status(),
                    Json(json!({ "status": "error", "info": denied.to_string() })),
                )
            })?;
            Ok(AdminGuard)
        }
    }
}

fn extract_bearer(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
