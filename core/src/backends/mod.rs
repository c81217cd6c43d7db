//! Remote [`FileSystem`] backends and the factory that picks one per service.
//!
//! Backends with heavy native dependencies are gated behind cargo features
//! so embedders that only move files locally can avoid them.

#[cfg(feature = "sftp")]
pub mod sftp;

use std::sync::Arc;

use tracing::debug;

use crate::config::{Protocol, ServiceConfig};
use crate::errors::CoreError;
use crate::files::local::LocalFileSystem;
use crate::files::FileSystem;

/// Build the filesystem serving the remote side of `config`.
///
/// SFTP sessions connect lazily on first use.
pub fn remote_file_system(config: &ServiceConfig) -> Result<Arc<dyn FileSystem>, CoreError> {
    config.validate()?;
    debug!(service = %config.name, protocol = ?config.protocol, "creating remote filesystem");
    match config.protocol {
        Protocol::Local => Ok(Arc::new(LocalFileSystem::new())),
        #[cfg(feature = "sftp")]
        Protocol::Sftp => Ok(Arc::new(sftp::SftpFileSystem::new(config.ssh.clone()))),
        #[cfg(not(feature = "sftp"))]
        Protocol::Sftp => Err(CoreError::Config(
            "this build has no SFTP support (enable the `sftp` feature)".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_protocol_builds_local_backend() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"protocol": "local", "remotePath": "/tmp"}"#).unwrap();
        assert!(remote_file_system(&config).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"protocol": "sftp", "remotePath": "/srv"}"#).unwrap();
        assert!(matches!(
            remote_file_system(&config),
            Err(CoreError::Config(_))
        ));
    }
}
