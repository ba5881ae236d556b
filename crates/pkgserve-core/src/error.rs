use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced while answering a package query.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid package name in query `{query}`")]
    InvalidPackageName { query: String },

    #[error("package `{name}` not found")]
    PackageNotFound { name: String },

    #[error("version `{version}` of package `{name}` not found")]
    VersionNotFound { name: String, version: String },

    #[error("storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PackageError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Short, client-safe description used in response envelopes.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "Invalid request",
            Self::InvalidPackageName { .. } => "Invalid package name",
            Self::PackageNotFound { .. } => "Package not found",
            Self::VersionNotFound { .. } => "Version not found",
            Self::StorageUnavailable { .. } => "Storage unavailable",
        }
    }
}

/// Result alias for package operations.
pub type PackageResult<T> = Result<T, PackageError>;
