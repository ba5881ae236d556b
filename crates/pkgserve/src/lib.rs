#![forbid(unsafe_code)]

pub mod boot;
pub mod config;
pub mod http;
pub mod server;

use anyhow::Result;

pub use config::{AllowedOrigins, ServerConfig};
pub use http::auth::AdminAuth;
pub use server::{PackageServer, ServerState, router};

pub use pkgserve_core::{PackageError, PackageService, StoreConfig};

/// Build the index, then serve until the listener fails.
pub async fn run(cfg: ServerConfig) -> Result<()> {
    let server = build(&cfg).await?;
    server.serve().await
}

/// Prepare a server without binding it.
pub async fn build(cfg: &ServerConfig) -> Result<PackageServer> {
    cfg.validate()?;
    let service = boot::start_service(cfg.store.clone()).await?;
    Ok(PackageServer::new(cfg, service, AdminAuth::from_env()))
}
