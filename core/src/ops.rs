//! Stateless file operations composed from [`FileSystem`] calls.
//!
//! These are the building blocks for one-off commands (`mkdir`, `rm`,
//! `touch`, diff). Managed transfers with mode preservation and staging go
//! through [`TransferTask`](crate::task::transfer::TransferTask) instead.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::FileError;
use crate::files::{FileSystem, OpenMode, PutOptions, ReadStream};

/// Options for [`transfer_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    /// Permission bits applied to the written file.
    pub mode: Option<u32>,
}

/// Options for [`create_dir`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateDirOptions {
    /// Create missing parent directories as well.
    pub recursive: bool,
}

/// Outcome of [`diff_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    /// Whether the local and remote contents decode to the same text.
    pub identical: bool,
    /// Local copy of the remote file. Left on disk for the caller to view.
    pub temp_path: PathBuf,
}

/// Stream `src` on `src_fs` into `dest` on `dest_fs`.
pub async fn transfer_file(
    src: &str,
    dest: &str,
    src_fs: &dyn FileSystem,
    dest_fs: &dyn FileSystem,
    options: FileOptions,
) -> Result<(), FileError> {
    let stream = src_fs.get(src).await?;
    dest_fs
        .put(stream, dest, PutOptions::default().mode(options.mode))
        .await
}

/// Recreate the symlink `src` at `dest`.
///
/// An existing entry at `dest` counts as success so retries are harmless.
pub async fn transfer_symlink(
    src: &str,
    dest: &str,
    src_fs: &dyn FileSystem,
    dest_fs: &dyn FileSystem,
) -> Result<(), FileError> {
    let target = src_fs.readlink(src).await?;
    match dest_fs.symlink(&target, dest).await {
        Err(e) if e.is_already_exists() => {
            debug!(path = dest, target = %target, "symlink already exists");
            Ok(())
        }
        result => result,
    }
}

pub async fn remove_file(path: &str, fs: &dyn FileSystem) -> Result<(), FileError> {
    fs.unlink(path).await
}

/// Remove a directory and everything below it.
pub async fn remove_dir(path: &str, fs: &dyn FileSystem) -> Result<(), FileError> {
    fs.rmdir(path, true).await
}

pub async fn rename(src: &str, dest: &str, fs: &dyn FileSystem) -> Result<(), FileError> {
    fs.rename(src, dest).await
}

/// Create a directory, and with `recursive` its missing parents.
///
/// Paths use `/` separators. In recursive mode an existing directory is
/// not an error.
pub async fn create_dir(
    path: &str,
    fs: &dyn FileSystem,
    options: CreateDirOptions,
) -> Result<(), FileError> {
    if !options.recursive {
        return fs.mkdir(path).await;
    }

    let mut current = String::with_capacity(path.len());
    if path.starts_with('/') {
        current.push('/');
    }
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        match fs.lstat(&current).await {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => return Err(FileError::AlreadyExists(current)),
            Err(e) if e.is_not_found() => match fs.mkdir(&current).await {
                Err(e) if !e.is_already_exists() => return Err(e),
                _ => debug!(path = %current, "created directory"),
            },
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create an empty file at `path`, refusing to touch an existing one.
pub async fn create_file(path: &str, fs: &dyn FileSystem) -> Result<(), FileError> {
    if fs.lstat(path).await.is_ok() {
        warn!(path, "Can't create file because it already exists");
        return Err(FileError::AlreadyExists(path.to_string()));
    }

    let fd = fs.open(path, OpenMode::Write).await?;
    let written = fs.put(ReadStream::empty(), path, PutOptions::with_fd(fd)).await;
    let closed = fs.close(fd).await;
    written.and(closed)
}

/// Copy `remote_path` next to a local temp file and compare it with
/// `local_path` as text.
pub async fn diff_remote(
    local_path: &str,
    remote_path: &str,
    local_fs: &dyn FileSystem,
    remote_fs: &dyn FileSystem,
) -> Result<DiffReport, FileError> {
    let suffix = Path::new(local_path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let temp_path = tempfile::Builder::new()
        .prefix("ferry-")
        .suffix(&suffix)
        .tempfile()?
        .into_temp_path();
    let temp = temp_path.to_string_lossy().to_string();

    // Until `keep`, dropping `temp_path` removes the file again.
    transfer_file(remote_path, &temp, remote_fs, local_fs, FileOptions::default()).await?;

    let (local, remote) = tokio::join!(local_fs.read_file(local_path), local_fs.read_file(&temp));
    let identical = String::from_utf8_lossy(&local?) == String::from_utf8_lossy(&remote?);
    info!(local = local_path, remote = remote_path, identical, "diff complete");

    let temp_path = temp_path.keep().map_err(|e| FileError::Io(e.error))?;

    Ok(DiffReport {
        identical,
        temp_path,
    })
}
