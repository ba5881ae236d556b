use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Router, serve};
use pkgserve_core::PackageService;
use tokio::net::TcpListener;

use crate::config::{AllowedOrigins, HEALTH_PATH, RELOAD_PATH, ServerConfig};
use crate::http::{self, admin, auth::AdminAuth, cors};

pub struct PackageServer {
    addr: SocketAddr,
    router: Router,
}

impl PackageServer {
    pub fn new(cfg: &ServerConfig, service: Arc<PackageService>, admin: AdminAuth) -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let state = ServerState { service, admin };
        Self {
            addr,
            router: router(state, &cfg.path, cfg.allowed_origins.clone()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        serve_on(listener, self.router).await
    }
}

/// Serve `router` on an already bound listener.
pub async fn serve_on(listener: TcpListener, router: Router) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "starting package server");
    serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// All routes with the cross-origin middleware applied.
pub fn router(state: ServerState, path: &str, origins: AllowedOrigins) -> Router {
    Router::new()
        .route(
            path,
            get(http::packages::query).options(cors::preflight),
        )
        .route(HEALTH_PATH, get(http::health::handler))
        .route(RELOAD_PATH, post(admin::reload))
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            Arc::new(origins),
            cors::apply,
        ))
}

#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<PackageService>,
    pub admin: AdminAuth,
}
