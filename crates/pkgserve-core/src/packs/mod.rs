use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::task;
use tokio::time::Instant;

use crate::env::StoreConfig;
use crate::error::{PackageError, PackageResult};

pub use cache::ArchiveCache;
pub use index::{PackageIndex, compare_versions};

mod archive;
mod cache;
mod index;

pub use archive::zip_directory;

/// MIME type of every archive handed out by the service.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Split `name@version` on the first `@`. An empty version counts as absent.
pub(crate) fn split_package(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (raw, None),
    }
}

/// Client query of the form `name[@version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageQuery {
    pub name: String,
    pub version: Option<String>,
}

impl PackageQuery {
    pub fn parse(raw: &str) -> Self {
        let (name, version) = split_package(raw);
        Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        }
    }
}

impl fmt::Display for PackageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

/// What the client wants back for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Only the latest version string.
    Check,
    /// The archive of the requested (or latest) version.
    Fetch,
}

impl RequestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Fetch => "fetch",
        }
    }
}

impl FromStr for RequestMode {
    type Err = PackageError;

    fn from_str(value: &str) -> PackageResult<Self> {
        match value {
            "check" => Ok(Self::Check),
            "fetch" => Ok(Self::Fetch),
            other => Err(PackageError::invalid_request(format!(
                "unsupported action `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub mode: RequestMode,
    pub query: PackageQuery,
}

impl PackageRequest {
    pub fn new(mode: RequestMode, query: PackageQuery) -> Self {
        Self { mode, query }
    }

    pub fn check(pkg: &str) -> Self {
        Self::new(RequestMode::Check, PackageQuery::parse(pkg))
    }

    pub fn fetch(pkg: &str) -> Self {
        Self::new(RequestMode::Fetch, PackageQuery::parse(pkg))
    }
}

/// A concrete package version known to the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
}

impl PackageRef {
    /// Directory name under the storage root, also the cache key.
    pub fn dir_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.dir_name())
    }
}

/// Archive bytes ready to be sent to a client.
#[derive(Debug, Clone)]
pub struct ArchivePayload {
    pub reference: PackageRef,
    pub bytes: Vec<u8>,
}

impl ArchivePayload {
    pub fn filename(&self) -> String {
        self.reference.archive_name()
    }

    pub fn content_type(&self) -> &'static str {
        ARCHIVE_CONTENT_TYPE
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Latest(PackageRef),
    Archive(ArchivePayload),
}

/// Observed state of the index refresh cycle.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    pub packages: usize,
    pub last_refresh: Option<SystemTime>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct RefreshMeta {
    built_at: Option<Instant>,
    built_wall: Option<SystemTime>,
    last_error: Option<String>,
}

/// Owns the package index and archive cache and answers package queries.
pub struct PackageService {
    cfg: StoreConfig,
    index: ArcSwap<PackageIndex>,
    meta: Mutex<RefreshMeta>,
    refresh_lock: tokio::sync::Mutex<()>,
    cache: ArchiveCache,
}

impl PackageService {
    pub fn new(cfg: StoreConfig) -> Self {
        let cache = ArchiveCache::new(cfg.root.clone(), cfg.archive_dir().to_path_buf());
        Self {
            cfg,
            index: ArcSwap::from_pointee(PackageIndex::default()),
            meta: Mutex::new(RefreshMeta::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            cache,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Current index; may be stale.
    pub fn snapshot(&self) -> Arc<PackageIndex> {
        self.index.load_full()
    }

    pub fn status(&self) -> RefreshStatus {
        let meta = self.meta.lock();
        RefreshStatus {
            packages: self.index.load().len(),
            last_refresh: meta.built_wall,
            last_error: meta.last_error.clone(),
        }
    }

    /// Wall-clock time of the last successful index build.
    pub fn last_refresh(&self) -> Option<SystemTime> {
        self.meta.lock().built_wall
    }

    pub fn is_stale(&self) -> bool {
        match self.meta.lock().built_at {
            Some(built_at) => built_at.elapsed() > self.cfg.refresh_interval,
            None => true,
        }
    }

    /// Rebuild the index unconditionally.
    pub async fn refresh(&self) -> PackageResult<Arc<PackageIndex>> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild().await
    }

    /// Rebuild the index if the refresh interval has elapsed.
    ///
    /// Only one rebuild runs at a time; callers queued behind it reuse its
    /// result.
    pub async fn ensure_fresh(&self) -> PackageResult<Arc<PackageIndex>> {
        if !self.is_stale() {
            return Ok(self.snapshot());
        }
        let _guard = self.refresh_lock.lock().await;
        if !self.is_stale() {
            return Ok(self.snapshot());
        }
        self.rebuild().await
    }

    async fn rebuild(&self) -> PackageResult<Arc<PackageIndex>> {
        let root = self.cfg.root.clone();
        let started = Instant::now();
        let scanned = task::spawn_blocking(move || PackageIndex::scan(&root))
            .await
            .map_err(|err| PackageError::storage(&self.cfg.root, std::io::Error::other(err)))
            .and_then(|result| result);

        match scanned {
            Ok(index) => {
                let index = Arc::new(index);
                self.index.store(Arc::clone(&index));
                let mut meta = self.meta.lock();
                meta.built_at = Some(Instant::now());
                meta.built_wall = Some(SystemTime::now());
                meta.last_error = None;
                tracing::info!(
                    packages = index.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    root = %self.cfg.root.display(),
                    "package index rebuilt"
                );
                Ok(index)
            }
            Err(err) => {
                tracing::error!(error = %err, "package index rebuild failed");
                self.meta.lock().last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Answer a check or fetch request.
    pub async fn resolve(&self, request: &PackageRequest) -> PackageResult<Resolution> {
        let query = &request.query;
        if query.name.is_empty() {
            return Err(PackageError::InvalidPackageName {
                query: query.to_string(),
            });
        }

        let index = self.ensure_fresh().await?;
        let latest = index
            .latest(&query.name)
            .ok_or_else(|| PackageError::PackageNotFound {
                name: query.name.clone(),
            })?;

        if request.mode == RequestMode::Check {
            return Ok(Resolution::Latest(PackageRef {
                name: query.name.clone(),
                version: latest.to_string(),
            }));
        }

        let version = match &query.version {
            Some(version) if index.contains(&query.name, version) => version.clone(),
            Some(version) => {
                return Err(PackageError::VersionNotFound {
                    name: query.name.clone(),
                    version: version.clone(),
                });
            }
            None => latest.to_string(),
        };
        let reference = PackageRef {
            name: query.name.clone(),
            version,
        };
        let bytes = self.cache.load(&reference).await?;
        Ok(Resolution::Archive(ArchivePayload { reference, bytes }))
    }
}
