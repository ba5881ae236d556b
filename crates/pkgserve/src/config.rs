use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use pkgserve_core::StoreConfig;
use serde::{Deserialize, Deserializer};
use serde_yaml_bw as serde_yaml;

/// Port the reference deployment listens on.
pub const DEFAULT_PORT: u16 = 443;

pub const HEALTH_PATH: &str = "/healthz";
pub const RELOAD_PATH: &str = "/admin/index/reload";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Route serving package queries.
    pub path: String,
    pub allowed_origins: AllowedOrigins,
    pub store: StoreConfig,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub allowed_origins: AllowedOrigins,
    #[serde(default)]
    pub store: Option<StoreConfig>,
}

impl ServerConfig {
    /// Load a YAML config file. Without a `store` section the store settings
    /// come from the PKGSERVE_* environment variables.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;

        let store = match file.store {
            Some(store) => resolve_store_paths(store, path.parent()),
            None => StoreConfig::from_env()?,
        };

        let cfg = Self {
            port: file.port,
            path: file.path,
            allowed_origins: file.allowed_origins,
            store,
            config_path: Some(path.to_path_buf()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: DEFAULT_PORT,
            path: default_path(),
            allowed_origins: AllowedOrigins::Any,
            store: StoreConfig::from_env()?,
            config_path: None,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store.root = root.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            bail!("request path `{}` must start with `/`", self.path);
        }
        if self.path == HEALTH_PATH || self.path.starts_with("/admin") {
            bail!("request path `{}` collides with a built-in route", self.path);
        }
        if self.store.refresh_interval.is_zero() {
            tracing::warn!("refresh interval is zero; the index is rebuilt on every query");
        }
        Ok(())
    }
}

/// Origins allowed to read responses cross-origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AllowedOrigins {
    #[default]
    Any,
    /// Bare hostnames; scheme and port are ignored when matching.
    Hosts(Vec<String>),
}

impl AllowedOrigins {
    pub fn hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Hosts(hosts.into_iter().map(Into::into).collect())
    }

    /// Value for `Access-Control-Allow-Origin`, if any, given the request's
    /// `Origin` header.
    pub fn allow_origin<'a>(&self, origin: Option<&'a str>) -> Option<&'a str> {
        match self {
            Self::Any => Some("*"),
            Self::Hosts(hosts) => {
                let origin = origin?;
                let host = origin_host(origin);
                hosts.iter().any(|allowed| allowed == host).then_some(origin)
            }
        }
    }
}

impl<'de> Deserialize<'de> for AllowedOrigins {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        let hosts = match Raw::deserialize(deserializer)? {
            Raw::One(value) => vec![value],
            Raw::Many(values) => values,
        };
        if hosts.iter().any(|host| host == "*") {
            Ok(Self::Any)
        } else {
            Ok(Self::Hosts(hosts))
        }
    }
}

/// Strip an `http://`/`https://` scheme and a trailing `:port` from an
/// `Origin` header value.
pub fn origin_host(origin: &str) -> &str {
    let without_scheme = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    match without_scheme.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|ch| ch.is_ascii_digit()) => host,
        _ => without_scheme,
    }
}

fn resolve_store_paths(mut store: StoreConfig, base: Option<&Path>) -> StoreConfig {
    let Some(base) = base else {
        return store;
    };
    if store.root.is_relative() {
        store.root = base.join(&store.root);
    }
    if let Some(dir) = store.archive_dir.take() {
        store.archive_dir = Some(if dir.is_relative() { base.join(dir) } else { dir });
    }
    store
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_path() -> String {
    "/".to_string()
}
