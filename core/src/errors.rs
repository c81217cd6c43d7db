//! Error types for the ferry core crate.
//!
//! Every backend normalizes its native failure codes (`std::io::ErrorKind`,
//! SFTP status codes, ...) into [`FileError`] at its own boundary, so the
//! transfer engine only ever reasons about this taxonomy.

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A file-operation error.
    #[error("File error: {0}")]
    File(#[from] FileError),

    /// A configuration error (invalid values, missing fields, parse failures).
    #[error("Config error: {0}")]
    Config(String),

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that don't fit other categories.
    #[error("{0}")]
    Other(String),
}

/// Errors raised by [`FileSystem`](crate::files::FileSystem) backends and the
/// operations composed on top of them.
#[derive(Error, Debug)]
pub enum FileError {
    /// The requested file or directory was not found.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The path already exists (create, mkdir or symlink collision).
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Permission was denied for the requested operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The read stream feeding this operation was aborted.
    #[error("Transfer cancelled")]
    Cancelled,

    /// The backend does not implement this operation.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// The backend could not establish or keep its session.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A file operation failed (I/O error, protocol failure, etc.).
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// A low-level I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileError {
    /// `true` for the "already exists" condition, whatever backend raised it.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// `true` when the error was caused by aborting the read stream.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` when the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Map a `std::io::Error` to a `FileError` based on its kind.
    pub fn from_io(e: std::io::Error, path: &str) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::OperationFailed(format!("{path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_error_display() {
        let err = FileError::NotFound("/tmp/missing".into());
        assert_eq!(err.to_string(), "File not found: /tmp/missing");

        let err = FileError::AlreadyExists("/tmp/a.txt".into());
        assert_eq!(err.to_string(), "File already exists: /tmp/a.txt");

        let err = FileError::PermissionDenied("/root".into());
        assert_eq!(err.to_string(), "Permission denied: /root");

        assert_eq!(FileError::Cancelled.to_string(), "Transfer cancelled");
    }

    #[test]
    fn from_io_maps_kinds() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            FileError::from_io(not_found, "/a"),
            FileError::NotFound(p) if p == "/a"
        ));

        let exists = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists");
        assert!(FileError::from_io(exists, "/a").is_already_exists());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            FileError::from_io(denied, "/a"),
            FileError::PermissionDenied(_)
        ));

        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        assert_eq!(
            FileError::from_io(other, "/a").to_string(),
            "Operation failed: /a: pipe broke"
        );
    }

    #[test]
    fn already_exists_covers_raw_io() {
        let raw: FileError = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "x").into();
        assert!(raw.is_already_exists());
        assert!(!FileError::Cancelled.is_already_exists());
    }

    #[test]
    fn not_found_covers_raw_io() {
        let raw: FileError = std::io::Error::new(std::io::ErrorKind::NotFound, "x").into();
        assert!(raw.is_not_found());
        assert!(FileError::NotFound("/x".into()).is_not_found());
        assert!(!FileError::Cancelled.is_not_found());
    }

    #[test]
    fn core_error_from_file_error() {
        let file_err = FileError::NotFound("/missing".into());
        let core_err: CoreError = file_err.into();
        assert_eq!(core_err.to_string(), "File error: File not found: /missing");
    }

    #[test]
    fn core_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let core_err: CoreError = io_err.into();
        assert_eq!(core_err.to_string(), "I/O error: gone");
    }
}
