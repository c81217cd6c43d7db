//! Local disk backend.
//!
//! Every call runs the blocking `std::fs` operation on
//! `tokio::task::spawn_blocking`. Open handles live in a table keyed by
//! [`Fd`] so they can be shared between `put`, `fstat`, `futimes` and `close`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use filetime::FileTime;

use super::{
    FileStat, FileSystem, FileType, Fd, OpenMode, PutOptions, ReadStream, PERMISSION_MASK,
    STREAM_CHUNK_SIZE,
};
use crate::errors::FileError;

type HandleTable = Mutex<HashMap<u64, (String, Arc<File>)>>;

/// Filesystem backend for the machine ferry runs on.
#[derive(Default)]
pub struct LocalFileSystem {
    handles: Arc<HandleTable>,
    next_fd: AtomicU64,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, fd: Fd) -> Result<(String, Arc<File>), FileError> {
        let table = self
            .handles
            .lock()
            .map_err(|e| FileError::OperationFailed(format!("Lock failed: {e}")))?;
        table
            .get(&fd.raw())
            .cloned()
            .ok_or_else(|| FileError::OperationFailed(format!("Unknown file handle {}", fd.raw())))
    }
}

/// Run a blocking closure off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, FileError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
}

#[async_trait::async_trait]
impl FileSystem for LocalFileSystem {
    async fn get(&self, path: &str) -> Result<ReadStream, FileError> {
        let path = path.to_string();
        let file = {
            let path = path.clone();
            blocking(move || File::open(&path).map_err(|e| FileError::from_io(e, &path))).await?
        };

        let (tx, stream) = ReadStream::channel();
        tokio::task::spawn_blocking(move || {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                if tx.is_aborted() {
                    break;
                }
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !tx.blocking_send(Ok(buf[..n].to_vec())) {
                            break;
                        }
                    }
                    Err(e) => {
                        tx.blocking_send(Err(FileError::from_io(e, &path)));
                        break;
                    }
                }
            }
        });
        Ok(stream)
    }

    async fn put(
        &self,
        stream: ReadStream,
        path: &str,
        options: PutOptions,
    ) -> Result<(), FileError> {
        let (path, file) = match options.fd {
            Some(fd) => self.handle(fd)?,
            None => {
                let path = path.to_string();
                let file = {
                    let path = path.clone();
                    blocking(move || open_sync(&path, OpenMode::Write)).await?
                };
                (path, Arc::new(file))
            }
        };

        blocking(move || {
            let mut stream = stream;
            let mut writer: &File = &file;
            while let Some(chunk) = stream.blocking_next_chunk()? {
                if stream.is_aborted() {
                    return Err(FileError::Cancelled);
                }
                writer
                    .write_all(&chunk)
                    .map_err(|e| FileError::from_io(e, &path))?;
            }
            if let Some(mode) = options.mode {
                set_mode(&file, mode, &path)?;
            }
            Ok(())
        })
        .await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FileError> {
        let path = path.to_string();
        let file = {
            let path = path.clone();
            blocking(move || open_sync(&path, mode)).await?
        };
        let fd = Fd::new(self.next_fd.fetch_add(1, Ordering::Relaxed));
        self.handles
            .lock()
            .map_err(|e| FileError::OperationFailed(format!("Lock failed: {e}")))?
            .insert(fd.raw(), (path, Arc::new(file)));
        Ok(fd)
    }

    async fn close(&self, fd: Fd) -> Result<(), FileError> {
        let removed = self
            .handles
            .lock()
            .map_err(|e| FileError::OperationFailed(format!("Lock failed: {e}")))?
            .remove(&fd.raw());
        // Dropping the last Arc closes the descriptor.
        match removed {
            Some(_) => Ok(()),
            None => Err(FileError::OperationFailed(format!(
                "Unknown file handle {}",
                fd.raw()
            ))),
        }
    }

    async fn fstat(&self, fd: Fd) -> Result<FileStat, FileError> {
        let (path, file) = self.handle(fd)?;
        blocking(move || {
            let metadata = file.metadata().map_err(|e| FileError::from_io(e, &path))?;
            Ok(stat_from_metadata(&metadata))
        })
        .await
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, FileError> {
        let path = path.to_string();
        blocking(move || {
            let metadata =
                std::fs::symlink_metadata(&path).map_err(|e| FileError::from_io(e, &path))?;
            Ok(stat_from_metadata(&metadata))
        })
        .await
    }

    async fn unlink(&self, path: &str) -> Result<(), FileError> {
        let path = path.to_string();
        blocking(move || std::fs::remove_file(&path).map_err(|e| FileError::from_io(e, &path)))
            .await
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FileError> {
        let path = path.to_string();
        blocking(move || {
            if recursive {
                std::fs::remove_dir_all(&path).map_err(|e| FileError::from_io(e, &path))
            } else {
                std::fs::remove_dir(&path).map_err(|e| FileError::from_io(e, &path))
            }
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), FileError> {
        let path = path.to_string();
        blocking(move || std::fs::create_dir(&path).map_err(|e| FileError::from_io(e, &path)))
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FileError> {
        let from = from.to_string();
        let to = to.to_string();
        blocking(move || std::fs::rename(&from, &to).map_err(|e| FileError::from_io(e, &from)))
            .await
    }

    async fn rename_atomic(&self, from: &str, to: &str) -> Result<(), FileError> {
        // rename(2) replaces an existing destination atomically.
        self.rename(from, to).await
    }

    async fn readlink(&self, path: &str) -> Result<String, FileError> {
        let path = path.to_string();
        blocking(move || {
            let target = std::fs::read_link(&path).map_err(|e| FileError::from_io(e, &path))?;
            Ok(target.to_string_lossy().to_string())
        })
        .await
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<(), FileError> {
        let target = target.to_string();
        let path = path.to_string();
        blocking(move || symlink_sync(&target, &path)).await
    }

    async fn futimes(&self, fd: Fd, atime: u64, mtime: u64) -> Result<(), FileError> {
        let (path, file) = self.handle(fd)?;
        blocking(move || {
            filetime::set_file_handle_times(
                &file,
                Some(FileTime::from_unix_time(atime as i64, 0)),
                Some(FileTime::from_unix_time(mtime as i64, 0)),
            )
            .map_err(|e| FileError::from_io(e, &path))
        })
        .await
    }
}

fn open_sync(path: &str, mode: OpenMode) -> Result<File, FileError> {
    let mut options = OpenOptions::new();
    match mode {
        OpenMode::Read => options.read(true),
        OpenMode::Write => options.write(true).create(true).truncate(true),
    };
    options.open(path).map_err(|e| FileError::from_io(e, path))
}

fn stat_from_metadata(metadata: &std::fs::Metadata) -> FileStat {
    let file_type = metadata.file_type();
    let file_type = if file_type.is_symlink() {
        FileType::SymbolicLink
    } else if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_file() {
        FileType::File
    } else {
        FileType::Other
    };

    let epoch_secs = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
    };

    FileStat {
        file_type,
        mode: permission_bits(metadata),
        size: metadata.len(),
        atime: epoch_secs(metadata.accessed()),
        mtime: epoch_secs(metadata.modified()),
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & PERMISSION_MASK
}

/// Without Unix modes, report the conventional bits for the read-only flag.
#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32, path: &str) -> Result<(), FileError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode & PERMISSION_MASK))
        .map_err(|e| FileError::from_io(e, path))
}

#[cfg(not(unix))]
fn set_mode(file: &File, mode: u32, path: &str) -> Result<(), FileError> {
    let mut permissions = file
        .metadata()
        .map_err(|e| FileError::from_io(e, path))?
        .permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    file.set_permissions(permissions)
        .map_err(|e| FileError::from_io(e, path))
}

#[cfg(unix)]
fn symlink_sync(target: &str, path: &str) -> Result<(), FileError> {
    std::os::unix::fs::symlink(target, path).map_err(|e| FileError::from_io(e, path))
}

#[cfg(not(unix))]
fn symlink_sync(_target: &str, path: &str) -> Result<(), FileError> {
    Err(FileError::NotSupported(format!("symlink {path}")))
}
