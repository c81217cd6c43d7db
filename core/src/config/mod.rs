//! Service configuration: which remote endpoint to talk to, how to log in,
//! where the local and remote trees are rooted, and the transfer policy.
//!
//! Config files are camelCase JSON holding one service object or an array
//! of them. String values may contain `${env:VAR}` placeholders, expanded by
//! [`ServiceConfig::expand`].

pub mod expand;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::files::PERMISSION_MASK;
use crate::task::transfer::TransferOption;

/// Which [`FileSystem`](crate::files::FileSystem) backend serves the remote side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    /// A directory on this machine acting as the remote tree.
    Local,
}

/// SSH login method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Key,
    Agent,
}

/// SSH connection settings.
///
/// With [`AuthMethod::Key`], `password` is the key passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            auth_method: AuthMethod::default(),
            password: None,
            key_path: None,
            connect_timeout_ms: None,
        }
    }
}

impl SshConfig {
    /// Return a copy with all `${env:...}` placeholders and `~` expanded.
    pub fn expand(mut self) -> Self {
        self.host = expand::expand_env_placeholders(&self.host);
        self.username = expand::expand_env_placeholders(&self.username);
        self.password = self.password.map(|s| expand::expand_env_placeholders(&s));
        self.key_path = self.key_path.map(|s| {
            // Pasted paths often keep their quotes.
            let stripped = s.trim().trim_matches('"').trim_matches('\'');
            expand::expand_path(stripped)
        });
        self
    }
}

/// Permission and staging policy applied to every transfer of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    /// Stage uploads at `<target>.new` and promote them when complete.
    #[serde(default)]
    pub use_temp_file: bool,
    /// The server supports `posix-rename@openssh.com`; promote with one
    /// atomic rename.
    #[serde(default)]
    pub open_ssh: bool,
    #[serde(default = "default_true")]
    pub preserve_target_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<u32>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            use_temp_file: false,
            open_ssh: false,
            preserve_target_mode: true,
            mode: None,
            fallback_mode: None,
        }
    }
}

impl TransferSettings {
    /// Build the per-transfer option set. Timestamps are in milliseconds.
    pub fn to_option(&self, atime_ms: Option<u64>, mtime_ms: Option<u64>) -> TransferOption {
        TransferOption {
            atime: atime_ms,
            mtime: mtime_ms,
            mode: self.mode,
            fallback_mode: self.fallback_mode,
            preserve_target_mode: self.preserve_target_mode,
            use_temp_file: self.use_temp_file,
            open_ssh: self.open_ssh,
        }
    }
}

/// One configured remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(flatten)]
    pub ssh: SshConfig,
    /// Absolute POSIX path of the remote tree root.
    pub remote_path: String,
    /// Local directory mirrored to `remote_path`.
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(flatten)]
    pub transfer: TransferSettings,
}

impl ServiceConfig {
    /// Return a copy with all `${env:...}` placeholders and `~` expanded.
    pub fn expand(mut self) -> Self {
        self.ssh = self.ssh.expand();
        self.name = expand::expand_env_placeholders(&self.name);
        self.remote_path = expand::expand_env_placeholders(&self.remote_path);
        self.context = expand::expand_path(&self.context);
        self
    }

    /// Check the fields a connection cannot do without.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.protocol == Protocol::Sftp {
            if self.ssh.host.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "service '{}': host is required for sftp",
                    self.name
                )));
            }
            if self.ssh.username.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "service '{}': username is required for sftp",
                    self.name
                )));
            }
        }
        if !self.remote_path.starts_with('/') {
            return Err(CoreError::Config(format!(
                "service '{}': remotePath must be absolute, got '{}'",
                self.name, self.remote_path
            )));
        }
        for (field, mode) in [
            ("mode", self.transfer.mode),
            ("fallbackMode", self.transfer.fallback_mode),
        ] {
            if let Some(mode) = mode {
                if mode & !PERMISSION_MASK != 0 {
                    return Err(CoreError::Config(format!(
                        "service '{}': {field} {mode:o} is not a permission mode",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remote path mirroring `local`.
    pub fn remote_path_for(&self, local: &Path) -> Result<String, CoreError> {
        to_remote_path(local, Path::new(&self.context), &self.remote_path)
    }

    /// Local path mirroring `remote`.
    pub fn local_path_for(&self, remote: &str) -> Result<PathBuf, CoreError> {
        to_local_path(remote, &self.remote_path, Path::new(&self.context))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<ServiceConfig>),
    One(Box<ServiceConfig>),
}

/// Load every service from a config file (one object or an array).
pub fn load_configs(path: impl AsRef<Path>) -> Result<Vec<ServiceConfig>, CoreError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let parsed: OneOrMany = serde_json::from_str(&text)
        .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
    let configs = match parsed {
        OneOrMany::Many(configs) => configs,
        OneOrMany::One(config) => vec![*config],
    };
    Ok(configs.into_iter().map(ServiceConfig::expand).collect())
}

/// Pick a service by name, or the only one when no name is given.
pub fn select_config(
    configs: Vec<ServiceConfig>,
    name: Option<&str>,
) -> Result<ServiceConfig, CoreError> {
    match name {
        Some(name) => configs
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CoreError::Config(format!("no service named '{name}'"))),
        None => {
            let count = configs.len();
            let mut configs = configs.into_iter();
            match (configs.next(), count) {
                (Some(config), 1) => Ok(config),
                (None, _) => Err(CoreError::Config("no services configured".to_string())),
                _ => Err(CoreError::Config(format!(
                    "{count} services configured; pick one with --name"
                ))),
            }
        }
    }
}

/// Translate a local path under `context` into the remote tree rooted at
/// `remote_root`.
pub fn to_remote_path(
    local: &Path,
    context: &Path,
    remote_root: &str,
) -> Result<String, CoreError> {
    let relative = local.strip_prefix(context).map_err(|_| {
        CoreError::Config(format!(
            "{} is outside the local root {}",
            local.display(),
            context.display()
        ))
    })?;

    let mut remote = remote_root.trim_end_matches('/').to_string();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                remote.push('/');
                remote.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            _ => {
                return Err(CoreError::Config(format!(
                    "{} cannot be mapped to a remote path",
                    local.display()
                )))
            }
        }
    }
    if remote.is_empty() {
        remote.push('/');
    }
    Ok(remote)
}

/// Translate a remote path under `remote_root` into the local tree rooted
/// at `context`.
pub fn to_local_path(remote: &str, remote_root: &str, context: &Path) -> Result<PathBuf, CoreError> {
    let root = remote_root.trim_end_matches('/');
    let relative = if remote.trim_end_matches('/') == root {
        ""
    } else {
        remote
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                CoreError::Config(format!("{remote} is outside the remote root {remote_root}"))
            })?
    };

    let mut local = context.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if part == ".." {
            return Err(CoreError::Config(format!(
                "{remote} cannot be mapped to a local path"
            )));
        }
        local.push(part);
    }
    Ok(local)
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_context() -> String {
    ".".to_string()
}
