//! Package store core for pkgserve.
//!
//! This crate scans a storage root for `name@version` package directories,
//! keeps an in-memory index of them that is refreshed lazily, resolves client
//! queries against that index, and builds zip archives of package directories
//! on first request.

pub mod env;
pub mod error;
pub mod packs;

pub use env::StoreConfig;
pub use error::{PackageError, PackageResult};
pub use packs::{
    ArchiveCache, ArchivePayload, PackageIndex, PackageQuery, PackageRef, PackageRequest,
    PackageService, RefreshStatus, RequestMode, Resolution,
};
