use std::path::PathBuf;

use clap::Parser;
use pkgserve::{ServerConfig, boot};
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "pkgserve", version, about = "Serve versioned package directories as zip archives")]
struct Cli {
    /// YAML configuration file
    #[arg(long, value_name = "PATH", env = "PKGSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (default 443)
    #[arg(long)]
    port: Option<u16>,

    /// Storage root holding `name@version` directories
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Route answering package queries (default `/`)
    #[arg(long)]
    path: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = boot::init_tracing() {
        eprintln!("failed to initialise logging: {err}");
    }
    if let Err(err) = run().await {
        tracing::error!(error = %format!("{err:#}"), "pkgserve failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => ServerConfig::load_from_path(path)?,
        None => ServerConfig::from_env()?,
    };
    if let Some(port) = cli.port {
        cfg = cfg.with_port(port);
    }
    if let Some(root) = cli.root {
        cfg = cfg.with_root(root);
    }
    if let Some(path) = cli.path {
        cfg = cfg.with_path(path);
    }

    let server = pkgserve::build(&cfg).await?;
    tokio::select! {
        result = server.serve() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }
    Ok(())
}
