//! Filesystem abstraction shared by every backend.
//!
//! [`FileSystem`] is the capability interface the transfer engine talks to.
//! Each backend (local disk, SFTP session, in-memory) implements it and maps
//! its native errors to [`FileError`] before they leave the backend.

pub mod local;
pub mod memory;
mod stream;

use serde::{Deserialize, Serialize};

use crate::errors::FileError;

pub use stream::{AbortHandle, ChunkSender, ReadStream, STREAM_CHUNK_SIZE};

/// Permission bits kept by [`FileStat::mode`].
pub const PERMISSION_MASK: u32 = 0o7777;

/// Opaque handle to a file opened through [`FileSystem::open`].
///
/// Only meaningful to the filesystem that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(u64);

impl Fd {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

/// How [`FileSystem::open`] opens a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; fails with `NotFound` if the path is absent.
    Read,
    /// Write-only; creates the file or truncates an existing one.
    Write,
}

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    File,
    Directory,
    SymbolicLink,
    Other,
}

/// Metadata returned by [`FileSystem::fstat`] and [`FileSystem::lstat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub file_type: FileType,
    /// Permission bits only (`mode & 0o7777`).
    pub mode: u32,
    pub size: u64,
    /// Seconds since the Unix epoch, when the backend reports it.
    pub atime: Option<u64>,
    /// Seconds since the Unix epoch, when the backend reports it.
    pub mtime: Option<u64>,
}

impl FileStat {
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::SymbolicLink
    }
}

/// Options for [`FileSystem::put`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Write through this already-open handle instead of opening `path`.
    /// The handle stays open afterwards; closing it is the caller's job.
    pub fd: Option<Fd>,
    /// Permission bits applied to the written file.
    pub mode: Option<u32>,
}

impl PutOptions {
    pub fn with_fd(fd: Fd) -> Self {
        Self {
            fd: Some(fd),
            mode: None,
        }
    }

    pub fn mode(mut self, mode: Option<u32>) -> Self {
        self.mode = mode;
        self
    }
}

/// Capability interface over one storage endpoint.
///
/// Implementations must be safe to call concurrently with fresh arguments;
/// no ordering is implied between calls on unrelated paths. Uses
/// `#[async_trait]` so engines can hold `Arc<dyn FileSystem>`.
#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    /// Open `path` for reading as a byte stream. Fails with `NotFound`.
    async fn get(&self, path: &str) -> Result<ReadStream, FileError>;

    /// Write `stream` to `path`, or through `options.fd` when given.
    ///
    /// Implementations check for an aborted stream before every write.
    async fn put(&self, stream: ReadStream, path: &str, options: PutOptions)
        -> Result<(), FileError>;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FileError>;

    async fn close(&self, fd: Fd) -> Result<(), FileError>;

    async fn fstat(&self, fd: Fd) -> Result<FileStat, FileError>;

    /// Stat `path` without following a final symlink.
    async fn lstat(&self, path: &str) -> Result<FileStat, FileError>;

    async fn unlink(&self, path: &str) -> Result<(), FileError>;

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FileError>;

    async fn mkdir(&self, path: &str) -> Result<(), FileError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), FileError>;

    /// Replace `to` with `from` in one step where the backend allows it,
    /// falling back to unlink + rename otherwise.
    async fn rename_atomic(&self, from: &str, to: &str) -> Result<(), FileError>;

    async fn readlink(&self, path: &str) -> Result<String, FileError>;

    /// Create a symlink at `path` pointing to `target`.
    async fn symlink(&self, target: &str, path: &str) -> Result<(), FileError>;

    /// Set access/modification times (whole seconds) on an open handle.
    ///
    /// Many servers only allow this for the file owner; callers treat
    /// `PermissionDenied` here as non-fatal.
    async fn futimes(&self, fd: Fd, atime: u64, mtime: u64) -> Result<(), FileError>;

    /// Read a whole file into memory.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileError> {
        self.get(path).await?.read_to_end().await
    }
}

impl dyn FileSystem {
    /// Abort an in-flight stream obtained from [`FileSystem::get`].
    ///
    /// Releases the producer at its next chunk and never fails.
    pub fn abort_readable_stream(handle: &AbortHandle) {
        handle.abort();
    }
}
