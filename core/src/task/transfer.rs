//! Single file or symlink transfer between two filesystems.
//!
//! A [`TransferTask`] streams one file from a source [`FileSystem`] to a
//! target, choosing the permission bits of the result, optionally staging
//! the upload at `<target>.new` and promoting it with a rename once the
//! payload and timestamps are in place.
//!
//! Mode resolution, highest priority first:
//!
//! 1. an explicit [`TransferOption::mode`];
//! 2. with [`TransferOption::preserve_target_mode`], the mode of the file
//!    already at the target path, probed through a read handle;
//! 3. [`TransferOption::fallback_mode`], also used whenever the probe fails.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Task, TaskState};
use crate::errors::FileError;
use crate::files::{AbortHandle, FileSystem, FileType, Fd, OpenMode, PutOptions, ReadStream};
use crate::ops;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::warn_once::TIMESTAMP_PERMISSION;

/// Suffix of the side path uploads are staged at.
pub const STAGED_SUFFIX: &str = ".new";

/// Where an upload to `target` is staged.
pub fn staged_path(target: &str) -> String {
    format!("{target}{STAGED_SUFFIX}")
}

/// A path together with the filesystem that resolves it.
#[derive(Clone)]
pub struct FileHandle {
    pub fs_path: String,
    pub file_system: Arc<dyn FileSystem>,
}

impl FileHandle {
    pub fn new(fs_path: impl Into<String>, file_system: Arc<dyn FileSystem>) -> Self {
        Self {
            fs_path: fs_path.into(),
            file_system,
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("fs_path", &self.fs_path)
            .finish_non_exhaustive()
    }
}

/// Which side of a transfer is the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalToRemote => f.write_str("local -> remote"),
            Self::RemoteToLocal => f.write_str("remote -> local"),
        }
    }
}

/// Permission, timestamp and staging policy for one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOption {
    /// Access time in milliseconds since the epoch.
    pub atime: Option<u64>,
    /// Modification time in milliseconds since the epoch.
    pub mtime: Option<u64>,
    pub mode: Option<u32>,
    pub fallback_mode: Option<u32>,
    pub preserve_target_mode: bool,
    pub use_temp_file: bool,
    /// Promote staged uploads with one atomic rename.
    pub open_ssh: bool,
}

/// Source stream, upload handle and resolved mode for a file transfer.
struct Prepared {
    stream: ReadStream,
    upload_fd: Fd,
    mode: Option<u32>,
}

/// Moves one file or symlink from `src` to `target`.
pub struct TransferTask {
    src: FileHandle,
    target: FileHandle,
    file_type: FileType,
    direction: TransferDirection,
    option: TransferOption,
    state: Mutex<TaskState>,
    cancelled: Arc<AtomicBool>,
    abort: Mutex<Option<AbortHandle>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl TransferTask {
    pub fn new(
        src: FileHandle,
        target: FileHandle,
        file_type: FileType,
        direction: TransferDirection,
        option: TransferOption,
    ) -> Self {
        Self {
            src,
            target,
            file_type,
            direction,
            option,
            state: Mutex::new(TaskState::Created),
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: Mutex::new(None),
            progress: None,
        }
    }

    /// Report per-chunk progress to `sink`, which may also request cancellation.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    /// The path on the local machine, whichever side it is on.
    pub fn local_fs_path(&self) -> &str {
        match self.direction {
            TransferDirection::RemoteToLocal => &self.target.fs_path,
            TransferDirection::LocalToRemote => &self.src.fs_path,
        }
    }

    pub fn src_fs_path(&self) -> &str {
        &self.src.fs_path
    }

    pub fn target_fs_path(&self) -> &str {
        &self.target.fs_path
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Move from `Created` to `Running`, or say why not.
    fn start(&self) -> Result<(), FileError> {
        let mut state = lock(&self.state);
        if *state != TaskState::Created {
            return Err(FileError::OperationFailed(format!(
                "transfer of {} is already {}",
                self.src.fs_path, *state
            )));
        }
        if self.is_cancelled() {
            *state = TaskState::Cancelled;
            return Err(FileError::Cancelled);
        }
        *state = TaskState::Running;
        Ok(())
    }

    fn finish(&self, result: &Result<(), FileError>) {
        let next = match result {
            Ok(()) => TaskState::Completed,
            Err(e) if e.is_cancelled() || self.is_cancelled() => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        *lock(&self.state) = next;
    }

    /// Take ownership of the stream's abort handle for [`cancel`](Task::cancel).
    fn register_stream(&self, stream: &ReadStream) {
        let handle = stream.abort_handle();
        let mut slot = lock(&self.abort);
        if self.is_cancelled() {
            <dyn FileSystem>::abort_readable_stream(&handle);
        }
        *slot = Some(handle);
    }

    /// Hook the progress sink into the stream, if there is one.
    async fn track_progress(&self, stream: ReadStream) -> ReadStream {
        let Some(sink) = self.progress.clone() else {
            return stream;
        };
        let total = match self.src.file_system.lstat(&self.src.fs_path).await {
            Ok(stat) => stat.size,
            Err(e) => {
                debug!(src = %self.src.fs_path, error = %e, "size unknown, progress stays at 0%");
                0
            }
        };

        let mut tracker = ProgressTracker::new(total);
        let cancelled = self.cancelled.clone();
        let abort = stream.abort_handle();
        stream.inspect_chunks(move |len| {
            sink.on_progress(&tracker.advance(len));
            if sink.cancel_requested() {
                cancelled.store(true, Ordering::SeqCst);
                abort.abort();
            }
        })
    }

    async fn transfer_file(&self) -> Result<(), FileError> {
        let target_fs = &self.target.file_system;
        let upload_target = if self.option.use_temp_file {
            staged_path(&self.target.fs_path)
        } else {
            self.target.fs_path.clone()
        };

        let Prepared {
            stream,
            upload_fd,
            mode,
        } = self.prepare(&upload_target).await?;
        self.register_stream(&stream);
        let stream = self.track_progress(stream).await;

        let outcome = self.upload(stream, upload_fd, &upload_target, mode).await;
        let closed = target_fs.close(upload_fd).await;

        match outcome {
            Ok(()) => closed,
            Err(e) => {
                if let Err(close_err) = closed {
                    debug!(path = %upload_target, error = %close_err, "closing upload handle failed");
                }
                self.discard_staged(&upload_target).await;
                Err(e)
            }
        }
    }

    /// Open the source stream and the upload handle, resolving the mode.
    ///
    /// An in-place target is only opened for writing once no cancellation
    /// has been seen, since that open truncates it.
    async fn prepare(&self, upload_target: &str) -> Result<Prepared, FileError> {
        let src_fs = &self.src.file_system;
        let target_fs = &self.target.file_system;
        let src = self.src.fs_path.as_str();
        let target = self.target.fs_path.as_str();
        let opt = &self.option;

        if opt.mode.is_some() || !opt.preserve_target_mode {
            let mode = opt.mode.or(opt.fallback_mode);
            if !opt.use_temp_file {
                let stream = src_fs.get(src).await?;
                if self.is_cancelled() {
                    stream.abort();
                    return Err(FileError::Cancelled);
                }
                let upload_fd = target_fs.open(upload_target, OpenMode::Write).await?;
                return Ok(Prepared {
                    stream,
                    upload_fd,
                    mode,
                });
            }
            let (stream, upload) =
                tokio::join!(src_fs.get(src), target_fs.open(upload_target, OpenMode::Write));
            let upload_fd = upload?;
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => return Err(self.abandon(upload_fd, upload_target, e).await),
            };
            return self
                .checked(
                    Prepared {
                        stream,
                        upload_fd,
                        mode,
                    },
                    upload_target,
                )
                .await;
        }

        // Without staging the probe must finish before the write-open creates
        // the target, or a new file would be mistaken for an existing one.
        let (probe, upload) = if opt.use_temp_file {
            tokio::join!(
                target_fs.open(target, OpenMode::Read),
                target_fs.open(upload_target, OpenMode::Write)
            )
        } else {
            let probe = target_fs.open(target, OpenMode::Read).await;
            if self.is_cancelled() {
                if let Ok(probe_fd) = probe {
                    self.close_probe(probe_fd).await;
                }
                return Err(FileError::Cancelled);
            }
            (probe, target_fs.open(upload_target, OpenMode::Write).await)
        };
        let probe = match probe {
            Ok(fd) => Some(fd),
            Err(e) => {
                debug!(path = target, error = %e, "no existing target to take the mode from");
                None
            }
        };
        let upload_fd = match upload {
            Ok(fd) => fd,
            Err(e) => {
                if let Some(probe_fd) = probe {
                    self.close_probe(probe_fd).await;
                }
                return Err(e);
            }
        };

        let (stream, mode) = match probe {
            Some(probe_fd) => {
                let (stream, stat) = tokio::join!(src_fs.get(src), target_fs.fstat(probe_fd));
                self.close_probe(probe_fd).await;
                let mode = match stat {
                    Ok(stat) => Some(stat.mode),
                    Err(e) => {
                        debug!(path = target, error = %e, "target mode unreadable, using fallback");
                        opt.fallback_mode
                    }
                };
                (stream, mode)
            }
            None => (src_fs.get(src).await, opt.fallback_mode),
        };

        match stream {
            Ok(stream) => {
                self.checked(
                    Prepared {
                        stream,
                        upload_fd,
                        mode,
                    },
                    upload_target,
                )
                .await
            }
            Err(e) => Err(self.abandon(upload_fd, upload_target, e).await),
        }
    }

    /// Hand `prepared` back unless the task was cancelled while it was set up.
    async fn checked(&self, prepared: Prepared, upload_target: &str) -> Result<Prepared, FileError> {
        if !self.is_cancelled() {
            return Ok(prepared);
        }
        prepared.stream.abort();
        Err(self
            .abandon(prepared.upload_fd, upload_target, FileError::Cancelled)
            .await)
    }

    async fn close_probe(&self, probe_fd: Fd) {
        if let Err(e) = self.target.file_system.close(probe_fd).await {
            debug!(path = %self.target.fs_path, error = %e, "closing probe handle failed");
        }
    }

    /// Release the upload handle after a failed setup and hand back `err`.
    async fn abandon(&self, upload_fd: Fd, upload_target: &str, err: FileError) -> FileError {
        if let Err(e) = self.target.file_system.close(upload_fd).await {
            debug!(path = upload_target, error = %e, "closing upload handle failed");
        }
        self.discard_staged(upload_target).await;
        err
    }

    /// Best-effort removal of a staged upload that will never be promoted.
    async fn discard_staged(&self, upload_target: &str) {
        if !self.option.use_temp_file {
            return;
        }
        match self.target.file_system.unlink(upload_target).await {
            Ok(()) => debug!(path = upload_target, "removed staged file"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(path = upload_target, error = %e, "failed to remove staged file"),
        }
    }

    /// Write the payload, set timestamps, then promote a staged upload.
    async fn upload(
        &self,
        stream: ReadStream,
        upload_fd: Fd,
        upload_target: &str,
        mode: Option<u32>,
    ) -> Result<(), FileError> {
        let target_fs = &self.target.file_system;
        let target = self.target.fs_path.as_str();
        let opt = &self.option;

        if opt.use_temp_file {
            info!(path = upload_target, "uploading temp file");
        }
        if self.is_cancelled() {
            return Err(FileError::Cancelled);
        }
        target_fs
            .put(stream, upload_target, PutOptions::with_fd(upload_fd).mode(mode))
            .await?;

        if let (Some(atime), Some(mtime)) = (opt.atime, opt.mtime) {
            if let Err(e) = target_fs.futimes(upload_fd, atime / 1000, mtime / 1000).await {
                if TIMESTAMP_PERMISSION.first() {
                    warn!(path = upload_target, "Can't set modified time on the file: {e}");
                } else {
                    debug!(path = upload_target, error = %e, "futimes failed");
                }
            }
        }

        if !opt.use_temp_file {
            return Ok(());
        }
        if self.is_cancelled() {
            return Err(FileError::Cancelled);
        }

        info!(from = upload_target, to = target, "moving staged file");
        if opt.open_ssh {
            target_fs.rename_atomic(upload_target, target).await
        } else {
            if let Err(e) = target_fs.unlink(target).await {
                debug!(path = target, error = %e, "unlink before rename failed");
            }
            target_fs.rename(upload_target, target).await
        }
    }
}

#[async_trait::async_trait]
impl Task for TransferTask {
    async fn run(&self) -> Result<(), FileError> {
        self.start()?;
        debug!(
            src = %self.src.fs_path,
            target = %self.target.fs_path,
            direction = %self.direction,
            "transfer started"
        );

        let result = match self.file_type {
            FileType::File => self.transfer_file().await,
            FileType::SymbolicLink => {
                ops::transfer_symlink(
                    &self.src.fs_path,
                    &self.target.fs_path,
                    self.src.file_system.as_ref(),
                    self.target.file_system.as_ref(),
                )
                .await
            }
            FileType::Directory | FileType::Other => {
                warn!(
                    src = %self.src.fs_path,
                    file_type = ?self.file_type,
                    "Unsupported file type, skipping"
                );
                Ok(())
            }
        };

        self.finish(&result);
        result
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(src = %self.src.fs_path, "transfer cancelled");
        if let Some(handle) = lock(&self.abort).as_ref() {
            <dyn FileSystem>::abort_readable_stream(handle);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTask")
            .field("src", &self.src.fs_path)
            .field("target", &self.target.fs_path)
            .field("file_type", &self.file_type)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
