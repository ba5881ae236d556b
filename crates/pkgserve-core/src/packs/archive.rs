use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use zip::CompressionMethod;
use zip::ZipWriter;
use zip::result::ZipError;
use zip::write::FileOptions;

use crate::error::{PackageError, PackageResult};

const COMPRESSION_LEVEL: i32 = 9;

/// Zip the contents of `source` into `dest`.
///
/// Entries are stored relative to `source`, so the directory's contents sit at
/// the archive root. Files are deflated at the maximum level. Returns the
/// number of file entries written.
pub fn zip_directory(source: &Path, dest: &Path) -> PackageResult<usize> {
    let file = File::create(dest).map_err(|err| PackageError::storage(dest, err))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let base = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL));

    let mut written = 0usize;
    for entry in walk(source)? {
        let name = entry_name(source, &entry.path);
        match entry.kind {
            EntryKind::Dir => {
                let options = with_permissions(base, &entry.metadata);
                zip.add_directory(format!("{name}/"), options)
                    .map_err(|err| zip_error(dest, err))?;
            }
            EntryKind::Symlink(target) => {
                // link targets are stored, never followed
                zip.add_symlink(name, target, FileOptions::default())
                    .map_err(|err| zip_error(dest, err))?;
            }
            EntryKind::File => {
                let options = with_permissions(base, &entry.metadata);
                zip.start_file(name, options)
                    .map_err(|err| zip_error(dest, err))?;
                let mut input = File::open(&entry.path)
                    .map_err(|err| PackageError::storage(&entry.path, err))?;
                io::copy(&mut input, &mut zip)
                    .map_err(|err| PackageError::storage(&entry.path, err))?;
                written += 1;
            }
        }
    }

    let mut writer = zip.finish().map_err(|err| zip_error(dest, err))?;
    io::Write::flush(&mut writer).map_err(|err| PackageError::storage(dest, err))?;
    Ok(written)
}

enum EntryKind {
    Dir,
    File,
    Symlink(String),
}

struct WalkEntry {
    path: PathBuf,
    metadata: fs::Metadata,
    kind: EntryKind,
}

/// Depth-first listing of everything under `root`, sorted per directory so
/// archives come out in a stable order. Symlinks are listed with their target
/// and not descended into.
fn walk(root: &Path) -> PackageResult<Vec<WalkEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children = fs::read_dir(&dir)
            .map_err(|err| PackageError::storage(&dir, err))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|err| PackageError::storage(&dir, err))?;
        children.sort();

        let mut subdirs = Vec::new();
        for path in children {
            let metadata =
                fs::symlink_metadata(&path).map_err(|err| PackageError::storage(&path, err))?;
            let file_type = metadata.file_type();
            let kind = if file_type.is_symlink() {
                let target =
                    fs::read_link(&path).map_err(|err| PackageError::storage(&path, err))?;
                EntryKind::Symlink(target.to_string_lossy().into_owned())
            } else if file_type.is_dir() {
                subdirs.push(path.clone());
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!(path = %path.display(), "skipping special file");
                continue;
            };
            out.push(WalkEntry {
                path,
                metadata,
                kind,
            });
        }
        // reversed so the stack pops them in sorted order
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(out)
}

fn entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn with_permissions(options: FileOptions, metadata: &fs::Metadata) -> FileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn with_permissions(options: FileOptions, _metadata: &fs::Metadata) -> FileOptions {
    options
}

fn zip_error(dest: &Path, err: ZipError) -> PackageError {
    let source = match err {
        ZipError::Io(io) => io,
        other => io::Error::other(other),
    };
    PackageError::storage(dest, source)
}
