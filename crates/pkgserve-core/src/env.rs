use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Default interval after which the index is rebuilt on the next query.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Storage layout and refresh cadence for the package store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding one `name@version` subdirectory per package version.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Where built archives are cached. Falls back to `root`.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub refresh_interval: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            archive_dir: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Build a [`StoreConfig`] by reading the documented PKGSERVE_* variables.
    pub fn from_env() -> Result<Self> {
        let root = env::var_os("PKGSERVE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_root);

        let archive_dir = env::var_os("PKGSERVE_ARCHIVE_DIR").map(PathBuf::from);

        let refresh_interval = match env::var("PKGSERVE_REFRESH") {
            Ok(raw) => humantime::parse_duration(raw.trim())
                .with_context(|| format!("PKGSERVE_REFRESH `{raw}` is not a valid duration"))?,
            Err(_) => DEFAULT_REFRESH_INTERVAL,
        };

        Ok(Self {
            root,
            archive_dir,
            refresh_interval,
        })
    }

    pub fn archive_dir(&self) -> &Path {
        self.archive_dir.as_deref().unwrap_or(&self.root)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(default_root())
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./pkgs")
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
