use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use pkgserve_core::{PackageService, StoreConfig};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

/// Create the package service and build its first index. A storage root that
/// cannot be scanned fails startup.
pub async fn start_service(store: StoreConfig) -> Result<Arc<PackageService>> {
    let root = store.root.clone();
    let service = Arc::new(PackageService::new(store));
    let index = service
        .refresh()
        .await
        .with_context(|| format!("initial package scan of {} failed", root.display()))?;
    tracing::info!(
        packages = index.len(),
        archives = %service.cache().root().display(),
        "package store ready"
    );
    Ok(service)
}
