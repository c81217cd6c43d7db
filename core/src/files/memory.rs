//! In-process filesystem backend.
//!
//! Paths map to inodes so an open handle keeps pointing at the same file
//! across renames, as it would on disk. Faults can be injected per instance
//! to reproduce backend conditions that are hard to trigger for real:
//! unreadable targets, failing `fstat`, servers refusing `futimes`.
//!
//! Every call is appended to an operation log (see [`MemoryFileSystem::calls`])
//! so callers can assert on ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    FileStat, FileSystem, FileType, Fd, OpenMode, PutOptions, ReadStream, PERMISSION_MASK,
};
use crate::errors::FileError;

/// Mode given to files created without an explicit one.
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const SYMLINK_MODE: u32 = 0o777;

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Inode {
    content: Content,
    mode: u32,
    atime: Option<u64>,
    mtime: Option<u64>,
}

impl Inode {
    fn stat(&self) -> FileStat {
        let (file_type, size) = match &self.content {
            Content::File(data) => (FileType::File, data.len() as u64),
            Content::Directory => (FileType::Directory, 0),
            Content::Symlink(target) => (FileType::SymbolicLink, target.len() as u64),
        };
        FileStat {
            file_type,
            mode: self.mode,
            size,
            atime: self.atime,
            mtime: self.mtime,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    inode: u64,
    mode: OpenMode,
}

#[derive(Debug, Default)]
struct Faults {
    unreadable: HashSet<String>,
    fail_fstat: bool,
    deny_futimes: bool,
    fail_rename: bool,
}

#[derive(Debug, Default)]
struct State {
    paths: BTreeMap<String, u64>,
    inodes: HashMap<u64, Inode>,
    handles: HashMap<u64, OpenFile>,
    next_inode: u64,
    next_fd: u64,
    faults: Faults,
    calls: Vec<String>,
}

impl State {
    fn insert(&mut self, path: &str, inode: Inode) -> u64 {
        let id = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(id, inode);
        self.paths.insert(path.to_string(), id);
        id
    }

    fn lookup(&self, path: &str) -> Result<&Inode, FileError> {
        self.paths
            .get(path)
            .and_then(|id| self.inodes.get(id))
            .ok_or_else(|| FileError::NotFound(path.to_string()))
    }

    fn open_file(&self, fd: Fd) -> Result<OpenFile, FileError> {
        self.handles
            .get(&fd.raw())
            .copied()
            .ok_or_else(|| FileError::OperationFailed(format!("Unknown file handle {}", fd.raw())))
    }

    fn inode_mut(&mut self, id: u64) -> Result<&mut Inode, FileError> {
        self.inodes
            .get_mut(&id)
            .ok_or_else(|| FileError::OperationFailed(format!("Stale inode {id}")))
    }

    fn remove_path(&mut self, path: &str) -> Option<u64> {
        let id = self.paths.remove(path)?;
        // Keep the inode alive while a handle still references it.
        if !self.handles.values().any(|h| h.inode == id) {
            self.inodes.remove(&id);
        }
        Some(id)
    }
}

/// Filesystem held entirely in memory.
pub struct MemoryFileSystem {
    state: Mutex<State>,
    chunk_size: usize,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: super::STREAM_CHUNK_SIZE,
        }
    }

    /// Split streams returned by `get` into chunks of `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(state: &mut State, call: String) {
        state.calls.push(call);
    }

    // ── Fixtures and inspection ──────────────────────────────────────

    /// Create or replace a regular file.
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>, mode: u32) {
        let mut state = self.state();
        state.remove_path(path);
        state.insert(
            path,
            Inode {
                content: Content::File(data.into()),
                mode: mode & PERMISSION_MASK,
                atime: None,
                mtime: None,
            },
        );
    }

    /// Create or replace a symlink.
    pub fn add_symlink(&self, path: &str, target: &str) {
        let mut state = self.state();
        state.remove_path(path);
        state.insert(
            path,
            Inode {
                content: Content::Symlink(target.to_string()),
                mode: SYMLINK_MODE,
                atime: None,
                mtime: None,
            },
        );
    }

    /// Create a directory entry.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.state();
        state.remove_path(path);
        state.insert(
            path,
            Inode {
                content: Content::Directory,
                mode: DEFAULT_DIR_MODE,
                atime: None,
                mtime: None,
            },
        );
    }

    /// Content of a regular file, `None` if absent or not a file.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        match state.lookup(path).ok()?.content {
            Content::File(ref data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn stat(&self, path: &str) -> Option<FileStat> {
        self.state().lookup(path).ok().map(Inode::stat)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().paths.contains_key(path)
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    /// Every call made so far, e.g. `"rename_atomic /a.new /a"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    // ── Fault injection ──────────────────────────────────────────────

    /// Make `open(path, Read)` fail with `PermissionDenied`.
    pub fn fail_open_read(&self, path: &str) {
        self.state().faults.unreadable.insert(path.to_string());
    }

    /// Make every `fstat` fail.
    pub fn fail_fstat(&self, fail: bool) {
        self.state().faults.fail_fstat = fail;
    }

    /// Make every `futimes` fail with `PermissionDenied`.
    pub fn deny_futimes(&self, deny: bool) {
        self.state().faults.deny_futimes = deny;
    }

    /// Make `rename` and `rename_atomic` fail.
    pub fn fail_rename(&self, fail: bool) {
        self.state().faults.fail_rename = fail;
    }

    fn write_fd(&self, fd: Fd, chunk: &[u8]) -> Result<(), FileError> {
        let mut state = self.state();
        let open = state.open_file(fd)?;
        if open.mode != OpenMode::Write {
            return Err(FileError::PermissionDenied(format!(
                "handle {} is read-only",
                fd.raw()
            )));
        }
        match &mut state.inode_mut(open.inode)?.content {
            Content::File(data) => {
                data.extend_from_slice(chunk);
                Ok(())
            }
            _ => Err(FileError::OperationFailed("not a regular file".to_string())),
        }
    }

    fn set_fd_mode(&self, fd: Fd, mode: u32) -> Result<(), FileError> {
        let mut state = self.state();
        let open = state.open_file(fd)?;
        state.inode_mut(open.inode)?.mode = mode & PERMISSION_MASK;
        Ok(())
    }

    fn rename_inner(&self, op: &str, from: &str, to: &str) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("{op} {from} {to}"));
        if state.faults.fail_rename {
            return Err(FileError::OperationFailed(format!("rename {from} refused")));
        }
        let id = state
            .paths
            .remove(from)
            .ok_or_else(|| FileError::NotFound(from.to_string()))?;
        state.remove_path(to);
        state.paths.insert(to.to_string(), id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileSystem for MemoryFileSystem {
    async fn get(&self, path: &str) -> Result<ReadStream, FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("get {path}"));
        let inode = state.lookup(path)?;
        let data = match &inode.content {
            Content::File(data) => data.clone(),
            Content::Symlink(target) => match &state.lookup(target)?.content {
                Content::File(data) => data.clone(),
                _ => return Err(FileError::OperationFailed(format!("{path}: not a file"))),
            },
            Content::Directory => {
                return Err(FileError::OperationFailed(format!("{path}: is a directory")))
            }
        };
        Ok(ReadStream::from_bytes(&data, self.chunk_size))
    }

    async fn put(
        &self,
        mut stream: ReadStream,
        path: &str,
        options: PutOptions,
    ) -> Result<(), FileError> {
        {
            let mut state = self.state();
            Self::record(&mut state, format!("put {path}"));
        }
        let (fd, owned) = match options.fd {
            Some(fd) => (fd, false),
            None => (self.open(path, OpenMode::Write).await?, true),
        };

        let mut written = async {
            while let Some(chunk) = stream.next_chunk().await? {
                if stream.is_aborted() {
                    return Err(FileError::Cancelled);
                }
                self.write_fd(fd, &chunk)?;
            }
            Ok::<(), FileError>(())
        }
        .await;
        if written.is_ok() {
            if let Some(mode) = options.mode {
                written = self.set_fd_mode(fd, mode);
            }
        }

        if owned {
            let closed = self.close(fd).await;
            return written.and(closed);
        }
        written
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FileError> {
        let mut state = self.state();
        let op = match mode {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
        };
        Self::record(&mut state, format!("open {path} {op}"));

        let inode = match mode {
            OpenMode::Read => {
                if state.faults.unreadable.contains(path) {
                    return Err(FileError::PermissionDenied(path.to_string()));
                }
                state.lookup(path)?;
                state.paths[path]
            }
            OpenMode::Write => match state.paths.get(path).copied() {
                Some(id) => {
                    let inode = state.inode_mut(id)?;
                    match &mut inode.content {
                        Content::File(data) => data.clear(),
                        _ => {
                            return Err(FileError::OperationFailed(format!(
                                "{path}: not a regular file"
                            )))
                        }
                    }
                    id
                }
                None => state.insert(
                    path,
                    Inode {
                        content: Content::File(Vec::new()),
                        mode: DEFAULT_FILE_MODE,
                        atime: None,
                        mtime: None,
                    },
                ),
            },
        };

        let fd = Fd::new(state.next_fd);
        state.next_fd += 1;
        state.handles.insert(fd.raw(), OpenFile { inode, mode });
        Ok(fd)
    }

    async fn close(&self, fd: Fd) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("close {}", fd.raw()));
        let open = state
            .handles
            .remove(&fd.raw())
            .ok_or_else(|| FileError::OperationFailed(format!("Unknown file handle {}", fd.raw())))?;
        let linked = state.paths.values().any(|id| *id == open.inode);
        let referenced = state.handles.values().any(|h| h.inode == open.inode);
        if !linked && !referenced {
            state.inodes.remove(&open.inode);
        }
        Ok(())
    }

    async fn fstat(&self, fd: Fd) -> Result<FileStat, FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("fstat {}", fd.raw()));
        if state.faults.fail_fstat {
            return Err(FileError::OperationFailed("fstat refused".to_string()));
        }
        let open = state.open_file(fd)?;
        Ok(state.inode_mut(open.inode)?.stat())
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("lstat {path}"));
        state.lookup(path).map(Inode::stat)
    }

    async fn unlink(&self, path: &str) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("unlink {path}"));
        if let Content::Directory = state.lookup(path)?.content {
            return Err(FileError::OperationFailed(format!("{path}: is a directory")));
        }
        state.remove_path(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("rmdir {path}"));
        if !matches!(state.lookup(path)?.content, Content::Directory) {
            return Err(FileError::OperationFailed(format!("{path}: not a directory")));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: Vec<String> = state
            .paths
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        if !children.is_empty() && !recursive {
            return Err(FileError::OperationFailed(format!("{path}: directory not empty")));
        }
        for child in children {
            state.remove_path(&child);
        }
        state.remove_path(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("mkdir {path}"));
        if state.paths.contains_key(path) {
            return Err(FileError::AlreadyExists(path.to_string()));
        }
        state.insert(
            path,
            Inode {
                content: Content::Directory,
                mode: DEFAULT_DIR_MODE,
                atime: None,
                mtime: None,
            },
        );
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FileError> {
        self.rename_inner("rename", from, to)
    }

    async fn rename_atomic(&self, from: &str, to: &str) -> Result<(), FileError> {
        self.rename_inner("rename_atomic", from, to)
    }

    async fn readlink(&self, path: &str) -> Result<String, FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("readlink {path}"));
        match &state.lookup(path)?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(FileError::OperationFailed(format!("{path}: not a symlink"))),
        }
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("symlink {target} {path}"));
        if state.paths.contains_key(path) {
            return Err(FileError::AlreadyExists(path.to_string()));
        }
        state.insert(
            path,
            Inode {
                content: Content::Symlink(target.to_string()),
                mode: SYMLINK_MODE,
                atime: None,
                mtime: None,
            },
        );
        Ok(())
    }

    async fn futimes(&self, fd: Fd, atime: u64, mtime: u64) -> Result<(), FileError> {
        let mut state = self.state();
        Self::record(&mut state, format!("futimes {} {atime} {mtime}", fd.raw()));
        if state.faults.deny_futimes {
            return Err(FileError::PermissionDenied(format!(
                "futimes on handle {}",
                fd.raw()
            )));
        }
        let open = state.open_file(fd)?;
        let inode = state.inode_mut(open.inode)?;
        inode.atime = Some(atime);
        inode.mtime = Some(mtime);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let fs = MemoryFileSystem::new();
        assert!(matches!(fs.get("/nope").await, Err(FileError::NotFound(_))));
    }

    #[tokio::test]
    async fn put_then_read_back() {
        let fs = MemoryFileSystem::new().with_chunk_size(2);
        fs.put(ReadStream::from_bytes(b"hello", 2), "/a.txt", PutOptions::default())
            .await
            .unwrap();
        assert_eq!(fs.read_file("/a.txt").await.unwrap(), b"hello");
        assert_eq!(fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn failed_put_reports_write_error_and_closes() {
        let fs = MemoryFileSystem::new();
        let stream = ReadStream::from_bytes(b"hello", 2);
        stream.abort();

        let err = fs
            .put(stream, "/a.txt", PutOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(fs.open_handles(), 0);
        assert!(fs.calls().iter().any(|c| c.starts_with("close")));
    }

    #[tokio::test]
    async fn open_write_truncates_and_keeps_mode() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/a.txt", "old", 0o600);
        let fd = fs.open("/a.txt", OpenMode::Write).await.unwrap();
        assert_eq!(fs.contents("/a.txt").unwrap(), b"");
        assert_eq!(fs.fstat(fd).await.unwrap().mode, 0o600);
        fs.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn handle_follows_inode_across_rename() {
        let fs = MemoryFileSystem::new();
        let fd = fs.open("/a.new", OpenMode::Write).await.unwrap();
        fs.put(ReadStream::from_bytes(b"data", 4), "/a.new", PutOptions::with_fd(fd))
            .await
            .unwrap();
        fs.rename("/a.new", "/a").await.unwrap();
        fs.futimes(fd, 1, 2).await.unwrap();
        fs.close(fd).await.unwrap();

        assert!(!fs.exists("/a.new"));
        let stat = fs.stat("/a").unwrap();
        assert_eq!(stat.mtime, Some(2));
        assert_eq!(fs.contents("/a").unwrap(), b"data");
    }

    #[tokio::test]
    async fn unlinked_inode_survives_until_close() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/a", "x", 0o644);
        let fd = fs.open("/a", OpenMode::Read).await.unwrap();
        fs.unlink("/a").await.unwrap();
        assert!(fs.fstat(fd).await.is_ok());
        fs.close(fd).await.unwrap();
        assert!(!fs.exists("/a"));
    }

    #[tokio::test]
    async fn injected_faults() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/a", "x", 0o644);

        fs.fail_open_read("/a");
        assert!(matches!(
            fs.open("/a", OpenMode::Read).await,
            Err(FileError::PermissionDenied(_))
        ));

        let fd = fs.open("/a", OpenMode::Write).await.unwrap();
        fs.fail_fstat(true);
        assert!(fs.fstat(fd).await.is_err());
        fs.deny_futimes(true);
        assert!(matches!(
            fs.futimes(fd, 1, 1).await,
            Err(FileError::PermissionDenied(_))
        ));
        fs.close(fd).await.unwrap();

        fs.fail_rename(true);
        assert!(fs.rename("/a", "/b").await.is_err());
        assert!(fs.exists("/a"));
    }

    #[tokio::test]
    async fn symlink_collision_is_already_exists() {
        let fs = MemoryFileSystem::new();
        fs.symlink("target", "/link").await.unwrap();
        assert_eq!(fs.readlink("/link").await.unwrap(), "target");
        let err = fs.symlink("target", "/link").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn rmdir_requires_recursive_for_children() {
        let fs = MemoryFileSystem::new();
        fs.mkdir("/d").await.unwrap();
        fs.add_file("/d/f", "x", 0o644);
        assert!(fs.rmdir("/d", false).await.is_err());
        fs.rmdir("/d", true).await.unwrap();
        assert!(!fs.exists("/d"));
        assert!(!fs.exists("/d/f"));
    }

    #[tokio::test]
    async fn calls_are_logged_in_order() {
        let fs = MemoryFileSystem::new();
        fs.mkdir("/d").await.unwrap();
        let _ = fs.lstat("/d/x").await;
        assert_eq!(fs.calls(), vec!["mkdir /d", "lstat /d/x"]);
    }
}
