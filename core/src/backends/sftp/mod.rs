//! SFTP backend implementing [`FileSystem`] over an `ssh2` session.
//!
//! The SSH session is opened lazily on first use and reused for every
//! later call. libssh2 is blocking, so each operation runs on
//! `tokio::task::spawn_blocking`. Remote handles opened through
//! [`FileSystem::open`] live in a table keyed by [`Fd`].

pub mod auth;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ssh2::{OpenFlags, OpenType, RenameFlags};
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::errors::FileError;
use crate::files::{
    FileStat, FileSystem, FileType, Fd, OpenMode, PutOptions, ReadStream, PERMISSION_MASK,
    STREAM_CHUNK_SIZE,
};

use self::auth::connect_and_authenticate;

// SSH_FX_* status codes from the SFTP draft.
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_FAILURE: i32 = 4;
const SSH_FX_OP_UNSUPPORTED: i32 = 8;
const SSH_FX_FILE_ALREADY_EXISTS: i32 = 11;

/// Mode for newly created remote files and directories before any explicit
/// mode is applied.
const DEFAULT_CREATE_MODE: i32 = 0o644;
const DEFAULT_DIR_MODE: i32 = 0o755;

/// State of a connected SFTP session.
struct SftpState {
    _session: ssh2::Session,
    sftp: ssh2::Sftp,
}

type RemoteFile = Arc<Mutex<ssh2::File>>;

/// Remote filesystem reached over SFTP.
pub struct SftpFileSystem {
    config: SshConfig,
    state: Arc<Mutex<Option<SftpState>>>,
    handles: Mutex<HashMap<u64, (String, RemoteFile)>>,
    next_fd: AtomicU64,
}

impl SftpFileSystem {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(None)),
            handles: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(0),
        }
    }

    /// Run `f` against the connected `Sftp` on a blocking thread.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T, FileError>
    where
        F: FnOnce(&ssh2::Sftp) -> Result<T, FileError> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let guard = ensure_connected(&state, &config)?;
            let sftp_state = guard
                .as_ref()
                .ok_or_else(|| FileError::Connection("SFTP not connected".to_string()))?;
            f(&sftp_state.sftp)
        })
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
    }

    fn handle(&self, fd: Fd) -> Result<(String, RemoteFile), FileError> {
        lock(&self.handles)?
            .get(&fd.raw())
            .cloned()
            .ok_or_else(|| FileError::OperationFailed(format!("Unknown file handle {}", fd.raw())))
    }

    fn register(&self, path: String, file: ssh2::File) -> Result<Fd, FileError> {
        let fd = Fd::new(self.next_fd.fetch_add(1, Ordering::Relaxed));
        lock(&self.handles)?.insert(fd.raw(), (path, Arc::new(Mutex::new(file))));
        Ok(fd)
    }
}

/// Open the session if needed and return the locked state.
fn ensure_connected<'a>(
    state: &'a Mutex<Option<SftpState>>,
    config: &SshConfig,
) -> Result<MutexGuard<'a, Option<SftpState>>, FileError> {
    let mut guard = lock(state)?;
    if guard.is_none() {
        let session = connect_and_authenticate(config)?;
        session.set_blocking(true);
        let sftp = session
            .sftp()
            .map_err(|e| FileError::Connection(format!("SFTP init failed: {e}")))?;
        info!(host = %config.host, port = config.port, "SFTP session opened");
        *guard = Some(SftpState {
            _session: session,
            sftp,
        });
    }
    Ok(guard)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, FileError> {
    mutex
        .lock()
        .map_err(|e| FileError::OperationFailed(format!("Lock failed: {e}")))
}

/// Map an SFTP status code to the shared error taxonomy.
fn map_ssh_error(e: ssh2::Error, path: &str) -> FileError {
    match e.code() {
        ssh2::ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => FileError::NotFound(path.to_string()),
        ssh2::ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => {
            FileError::PermissionDenied(path.to_string())
        }
        ssh2::ErrorCode::SFTP(SSH_FX_FILE_ALREADY_EXISTS) => {
            FileError::AlreadyExists(path.to_string())
        }
        ssh2::ErrorCode::SFTP(SSH_FX_OP_UNSUPPORTED) => {
            FileError::NotSupported(format!("{path}: {}", e.message()))
        }
        _ => FileError::OperationFailed(format!("{path}: {}", e.message())),
    }
}

fn is_generic_failure(e: &ssh2::Error) -> bool {
    matches!(e.code(), ssh2::ErrorCode::SFTP(SSH_FX_FAILURE))
}

fn stat_from_sftp(stat: &ssh2::FileStat) -> FileStat {
    let kind = stat.file_type();
    let file_type = if kind.is_symlink() {
        FileType::SymbolicLink
    } else if kind.is_dir() {
        FileType::Directory
    } else if kind.is_file() {
        FileType::File
    } else {
        FileType::Other
    };
    FileStat {
        file_type,
        mode: stat.perm.unwrap_or(0) & PERMISSION_MASK,
        size: stat.size.unwrap_or(0),
        atime: stat.atime,
        mtime: stat.mtime,
    }
}

fn attrs() -> ssh2::FileStat {
    ssh2::FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

fn open_remote(sftp: &ssh2::Sftp, path: &str, mode: OpenMode) -> Result<ssh2::File, FileError> {
    let flags = match mode {
        OpenMode::Read => OpenFlags::READ,
        OpenMode::Write => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
    };
    sftp.open_mode(Path::new(path), flags, DEFAULT_CREATE_MODE, OpenType::File)
        .map_err(|e| map_ssh_error(e, path))
}

fn write_stream(
    file: &mut ssh2::File,
    mut stream: ReadStream,
    path: &str,
    mode: Option<u32>,
) -> Result<(), FileError> {
    while let Some(chunk) = stream.blocking_next_chunk()? {
        if stream.is_aborted() {
            return Err(FileError::Cancelled);
        }
        file.write_all(&chunk)
            .map_err(|e| FileError::OperationFailed(format!("{path}: write failed: {e}")))?;
    }
    if let Some(mode) = mode {
        file.setstat(ssh2::FileStat {
            perm: Some(mode & PERMISSION_MASK),
            ..attrs()
        })
        .map_err(|e| map_ssh_error(e, path))?;
    }
    Ok(())
}

fn remove_tree(sftp: &ssh2::Sftp, path: &Path) -> Result<(), FileError> {
    let display = path.to_string_lossy();
    let entries = sftp
        .readdir(path)
        .map_err(|e| map_ssh_error(e, &display))?;
    for (child, stat) in entries {
        let name = child
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name == "." || name == ".." {
            continue;
        }
        // readdir follows nothing: a symlink to a directory is unlinked, not descended.
        if stat.file_type().is_dir() {
            remove_tree(sftp, &child)?;
        } else {
            sftp.unlink(&child)
                .map_err(|e| map_ssh_error(e, &child.to_string_lossy()))?;
        }
    }
    sftp.rmdir(path).map_err(|e| map_ssh_error(e, &display))
}

#[async_trait::async_trait]
impl FileSystem for SftpFileSystem {
    async fn get(&self, path: &str) -> Result<ReadStream, FileError> {
        let remote = {
            let path = path.to_string();
            self.with_sftp(move |sftp| open_remote(sftp, &path, OpenMode::Read))
                .await?
        };

        let path = path.to_string();
        let (tx, stream) = ReadStream::channel();
        tokio::task::spawn_blocking(move || {
            let mut remote = remote;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                if tx.is_aborted() {
                    debug!(path = %path, "SFTP read aborted");
                    break;
                }
                match remote.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !tx.blocking_send(Ok(buf[..n].to_vec())) {
                            break;
                        }
                    }
                    Err(e) => {
                        tx.blocking_send(Err(FileError::OperationFailed(format!(
                            "{path}: read failed: {e}"
                        ))));
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
        let (path, file, owned) = match options.fd {
            Some(fd) => {
                let (path, file) = self.handle(fd)?;
                (path, file, false)
            }
            None => {
                let path = path.to_string();
                let remote = {
                    let path = path.clone();
                    self.with_sftp(move |sftp| open_remote(sftp, &path, OpenMode::Write))
                        .await?
                };
                (path, Arc::new(Mutex::new(remote)), true)
            }
        };

        // Only the file handle is locked while writing; other calls on the
        // session can proceed.
        tokio::task::spawn_blocking(move || {
            let mut remote = lock(&file)?;
            let written = write_stream(&mut remote, stream, &path, options.mode);
            if owned {
                let closed = remote.close().map_err(|e| map_ssh_error(e, &path));
                return written.and(closed);
            }
            written
        })
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FileError> {
        let remote = {
            let path = path.to_string();
            self.with_sftp(move |sftp| open_remote(sftp, &path, mode))
                .await?
        };
        self.register(path.to_string(), remote)
    }

    async fn close(&self, fd: Fd) -> Result<(), FileError> {
        let removed = lock(&self.handles)?.remove(&fd.raw());
        let Some((path, file)) = removed else {
            return Err(FileError::OperationFailed(format!(
                "Unknown file handle {}",
                fd.raw()
            )));
        };
        // The remote handle is closed when the last reference drops; do it
        // off the executor since libssh2 round-trips to the server.
        tokio::task::spawn_blocking(move || {
            let mut remote = lock(&file)?;
            remote.close().map_err(|e| map_ssh_error(e, &path))
        })
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
    }

    async fn fstat(&self, fd: Fd) -> Result<FileStat, FileError> {
        let (path, file) = self.handle(fd)?;
        tokio::task::spawn_blocking(move || {
            let stat = lock(&file)?.stat().map_err(|e| map_ssh_error(e, &path))?;
            Ok(stat_from_sftp(&stat))
        })
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, FileError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let stat = sftp
                .lstat(Path::new(&path))
                .map_err(|e| map_ssh_error(e, &path))?;
            Ok(stat_from_sftp(&stat))
        })
        .await
    }

    async fn unlink(&self, path: &str) -> Result<(), FileError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.unlink(Path::new(&path))
                .map_err(|e| map_ssh_error(e, &path))
        })
        .await
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FileError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            if recursive {
                remove_tree(sftp, Path::new(&path))
            } else {
                sftp.rmdir(Path::new(&path))
                    .map_err(|e| map_ssh_error(e, &path))
            }
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), FileError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.mkdir(Path::new(&path), DEFAULT_DIR_MODE).map_err(|e| {
                // Most servers answer a collision with a bare SSH_FX_FAILURE.
                if is_generic_failure(&e) && sftp.lstat(Path::new(&path)).is_ok() {
                    FileError::AlreadyExists(path.clone())
                } else {
                    map_ssh_error(e, &path)
                }
            })
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FileError> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_sftp(move |sftp| {
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .map_err(|e| map_ssh_error(e, &from))
        })
        .await
    }

    async fn rename_atomic(&self, from: &str, to: &str) -> Result<(), FileError> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_sftp(move |sftp| {
            let flags = RenameFlags::ATOMIC | RenameFlags::OVERWRITE | RenameFlags::NATIVE;
            match sftp.rename(Path::new(&from), Path::new(&to), Some(flags)) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Servers without posix-rename@openssh.com refuse to
                    // overwrite; replace the target in two steps instead.
                    debug!(from = %from, to = %to, error = %e, "atomic rename refused, falling back");
                    match sftp.unlink(Path::new(&to)) {
                        Ok(()) => {}
                        Err(e) if matches!(e.code(), ssh2::ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE)) => {}
                        Err(e) => return Err(map_ssh_error(e, &to)),
                    }
                    sftp.rename(Path::new(&from), Path::new(&to), None)
                        .map_err(|e| map_ssh_error(e, &from))
                }
            }
        })
        .await
    }

    async fn readlink(&self, path: &str) -> Result<String, FileError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let target = sftp
                .readlink(Path::new(&path))
                .map_err(|e| map_ssh_error(e, &path))?;
            Ok(target.to_string_lossy().to_string())
        })
        .await
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<(), FileError> {
        let target = target.to_string();
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            // ssh2 names its arguments (path, target) with the link created at `target`.
            sftp.symlink(Path::new(&target), Path::new(&path))
                .map_err(|e| {
                    if is_generic_failure(&e) && sftp.lstat(Path::new(&path)).is_ok() {
                        FileError::AlreadyExists(path.clone())
                    } else {
                        map_ssh_error(e, &path)
                    }
                })
        })
        .await
    }

    async fn futimes(&self, fd: Fd, atime: u64, mtime: u64) -> Result<(), FileError> {
        let (path, file) = self.handle(fd)?;
        tokio::task::spawn_blocking(move || {
            let mut remote = lock(&file)?;
            remote
                .setstat(ssh2::FileStat {
                    atime: Some(atime),
                    mtime: Some(mtime),
                    ..attrs()
                })
                .map_err(|e| map_ssh_error(e, &path))
        })
        .await
        .map_err(|e| FileError::OperationFailed(format!("Task join failed: {e}")))?
    }
}
