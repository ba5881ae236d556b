use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task;

use crate::error::{PackageError, PackageResult};

use super::PackageRef;
use super::archive::zip_directory;

/// On-disk cache of built package archives.
///
/// An archive is built once per `name@version` and never invalidated; its
/// presence on disk is the cache hit. Builds for the same key are serialized
/// so concurrent first requests share one build.
pub struct ArchiveCache {
    source_root: PathBuf,
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArchiveCache {
    pub fn new(source_root: PathBuf, root: PathBuf) -> Self {
        Self {
            source_root,
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, reference: &PackageRef) -> PathBuf {
        self.root.join(reference.archive_name())
    }

    pub fn source_path(&self, reference: &PackageRef) -> PathBuf {
        self.source_root.join(reference.dir_name())
    }

    /// Return the archive for `reference`, building it first if needed.
    pub async fn ensure(&self, reference: &PackageRef) -> PackageResult<PathBuf> {
        let dest = self.archive_path(reference);
        if dest.is_file() {
            return Ok(dest);
        }

        let lock = self.lock_for(reference);
        let built = {
            let _guard = lock.lock().await;
            // a concurrent request may have finished the build while we waited
            if dest.is_file() {
                Ok(None)
            } else {
                self.build(reference, &dest).await.map(Some)
            }
        };
        self.release(reference, lock);

        if let Some(files) = built? {
            tracing::info!(
                package = %reference.name,
                version = %reference.version,
                files,
                path = %dest.display(),
                "archive built"
            );
        }
        Ok(dest)
    }

    async fn build(&self, reference: &PackageRef, dest: &Path) -> PackageResult<usize> {
        let source = self.source_path(reference);
        let target = dest.to_path_buf();
        let root = self.root.clone();
        task::spawn_blocking(move || build_atomic(&source, &root, &target))
            .await
            .map_err(|err| PackageError::storage(dest, std::io::Error::other(err)))?
    }

    /// Return the archive bytes for `reference`, building it first if needed.
    pub async fn load(&self, reference: &PackageRef) -> PackageResult<Vec<u8>> {
        let path = self.ensure(reference).await?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| PackageError::storage(&path, err))
    }

    fn lock_for(&self, reference: &PackageRef) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(reference.dir_name()).or_default())
    }

    /// Drop the per-key lock once no other request holds it.
    fn release(&self, reference: &PackageRef, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // one reference in the map, one held here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&reference.dir_name());
        }
    }

    #[cfg(test)]
    fn pending_locks(&self) -> usize {
        self.locks.lock().len()
    }
}

fn build_atomic(source: &Path, root: &Path, dest: &Path) -> PackageResult<usize> {
    fs::create_dir_all(root).map_err(|err| PackageError::storage(root, err))?;
    let tmp = dest.with_extension(format!(
        "zip.tmp-{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_nanos())
            .unwrap_or(0)
    ));
    let files = match zip_directory(source, &tmp) {
        Ok(files) => files,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            tracing::error!(source = %source.display(), error = %err, "archive build failed");
            return Err(err);
        }
    };
    fs::rename(&tmp, dest).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        PackageError::storage(dest, err)
    })?;
    Ok(files)
}
