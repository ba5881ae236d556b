use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{PackageError, PackageResult};

use super::split_package;

/// Snapshot of the packages available in the storage root.
///
/// Each version list is non-empty and sorted with [`compare_versions`], so the
/// last element is the latest version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageIndex {
    packages: BTreeMap<String, Vec<String>>,
}

impl PackageIndex {
    /// Scan `root` for `name@version` directories.
    ///
    /// Plain files, entries without an `@`, entries with an empty name or
    /// version, and names that are not valid UTF-8 are skipped.
    pub fn scan(root: &Path) -> PackageResult<Self> {
        let entries = fs::read_dir(root).map_err(|err| PackageError::storage(root, err))?;

        let mut index = Self::default();
        for entry in entries {
            let entry = entry.map_err(|err| PackageError::storage(root, err))?;
            let path = entry.path();
            // follow symlinks so linked package dirs are still served
            let is_dir = fs::metadata(&path)
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::debug!(path = %path.display(), "skipping non UTF-8 entry");
                continue;
            };
            match split_package(&file_name) {
                (name, Some(version)) if !name.is_empty() => index.insert(name, version),
                _ => tracing::debug!(entry = %file_name, "skipping entry without name@version"),
            }
        }
        index.sort();
        Ok(index)
    }

    /// Build an index from `(name, version)` pairs, applying the same
    /// filtering and ordering as [`PackageIndex::scan`].
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut index = Self::default();
        for (name, version) in entries {
            if !name.is_empty() && !version.is_empty() {
                index.insert(name, version);
            }
        }
        index.sort();
        index
    }

    fn insert(&mut self, name: &str, version: &str) {
        self.packages
            .entry(name.to_string())
            .or_default()
            .push(version.to_string());
    }

    fn sort(&mut self) {
        for versions in self.packages.values_mut() {
            versions.sort_by(|a, b| compare_versions(a, b));
            versions.dedup();
        }
    }

    pub fn versions(&self, name: &str) -> Option<&[String]> {
        self.packages.get(name).map(Vec::as_slice)
    }

    pub fn latest(&self, name: &str) -> Option<&str> {
        self.versions(name)
            .and_then(|versions| versions.last())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.versions(name)
            .is_some_and(|versions| versions.iter().any(|v| v == version))
    }

    pub fn packages(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.packages
            .iter()
            .map(|(name, versions)| (name.as_str(), versions.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Version ordering used for "latest".
///
/// This is a plain lexicographic comparison, so `10.0.0` sorts before
/// `9.0.0`. Clients rely on the existing ordering; keep it.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    a.cmp(b)
}
