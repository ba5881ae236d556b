use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use pkgserve_core::{PackageRequest, PackageService, Resolution, StoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = if env::var_os("PKGSERVE_ROOT").is_some() {
        StoreConfig::from_env()?
    } else {
        let root = env::temp_dir().join("pkgserve-demo");
        ensure_example_store(&root)?;
        StoreConfig::new(root)
    };
    let service = PackageService::new(cfg);
    let index = service.refresh().await?;
    for (name, versions) in index.packages() {
        println!("{name}: {}", versions.join(", "));
    }

    let pkg = env::args().nth(1).unwrap_or_else(|| "hello".to_string());
    match service.resolve(&PackageRequest::fetch(&pkg)).await? {
        Resolution::Archive(payload) => println!(
            "{} ready ({} bytes) at {}",
            payload.filename(),
            payload.bytes.len(),
            service.cache().archive_path(&payload.reference).display()
        ),
        Resolution::Latest(reference) => println!("latest {}", reference.version),
    }
    Ok(())
}

fn ensure_example_store(root: &Path) -> Result<()> {
    for version in ["0.1.0", "0.2.0"] {
        let dir = root.join(format!("hello@{version}"));
        if dir.exists() {
            continue;
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(dir.join("hello.txt"), format!("hello from {version}\n"))?;
    }
    Ok(())
}
