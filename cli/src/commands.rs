//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use ferry_core::backends::remote_file_system;
use ferry_core::config::{load_configs, select_config, ServiceConfig};
use ferry_core::errors::FileError;
use ferry_core::files::local::LocalFileSystem;
use ferry_core::files::{FileStat, FileSystem};
use ferry_core::ops::{self, CreateDirOptions};
use ferry_core::task::transfer::{FileHandle, TransferDirection, TransferTask};
use ferry_core::task::Scheduler;
use tracing::{error, info, warn};

use crate::progress::CliProgress;

pub fn load_service(config: &Path, name: Option<&str>) -> anyhow::Result<ServiceConfig> {
    let configs = load_configs(config)
        .with_context(|| format!("Failed to load config from {}", config.display()))?;
    let service = select_config(configs, name)?;
    service.validate()?;
    Ok(service)
}

/// One queued transfer, kept for reporting.
struct Planned {
    label: String,
    task: Arc<TransferTask>,
}

pub async fn upload(service: &ServiceConfig, paths: &[PathBuf], jobs: usize) -> anyhow::Result<()> {
    let service = &anchored(service)?;
    let remote = remote_file_system(service)?;
    let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let interrupted = Arc::new(AtomicBool::new(false));

    let mut planned = Vec::with_capacity(paths.len());
    for path in paths {
        let local_path = absolute(path)?;
        let remote_path = service.remote_path_for(&local_path)?;
        let local_path = local_path.to_string_lossy().to_string();
        let stat = local
            .lstat(&local_path)
            .await
            .with_context(|| format!("Cannot upload {local_path}"))?;

        if let Some((parent, _)) = remote_path.rsplit_once('/') {
            if !parent.is_empty() {
                ops::create_dir(parent, remote.as_ref(), CreateDirOptions { recursive: true })
                    .await
                    .with_context(|| format!("Cannot create remote directory {parent}"))?;
            }
        }

        let (atime, mtime) = times_ms(&stat);
        let task = TransferTask::new(
            FileHandle::new(&local_path, local.clone()),
            FileHandle::new(&remote_path, remote.clone()),
            stat.file_type,
            TransferDirection::LocalToRemote,
            service.transfer.to_option(atime, mtime),
        )
        .with_progress(Arc::new(CliProgress::new(&local_path, interrupted.clone())));
        planned.push(Planned {
            label: format!("{local_path} -> {remote_path}"),
            task: Arc::new(task),
        });
    }

    run_transfers(planned, jobs, interrupted).await
}

pub async fn download(service: &ServiceConfig, paths: &[String], jobs: usize) -> anyhow::Result<()> {
    let service = &anchored(service)?;
    let remote = remote_file_system(service)?;
    let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let interrupted = Arc::new(AtomicBool::new(false));

    let mut planned = Vec::with_capacity(paths.len());
    for path in paths {
        let remote_path = resolve_remote(service, path);
        let local_path = service.local_path_for(&remote_path)?;
        let stat = remote
            .lstat(&remote_path)
            .await
            .with_context(|| format!("Cannot download {remote_path}"))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let local_path = local_path.to_string_lossy().to_string();

        let (atime, mtime) = times_ms(&stat);
        let task = TransferTask::new(
            FileHandle::new(&remote_path, remote.clone()),
            FileHandle::new(&local_path, local.clone()),
            stat.file_type,
            TransferDirection::RemoteToLocal,
            service.transfer.to_option(atime, mtime),
        )
        .with_progress(Arc::new(CliProgress::new(&local_path, interrupted.clone())));
        planned.push(Planned {
            label: format!("{remote_path} -> {local_path}"),
            task: Arc::new(task),
        });
    }

    run_transfers(planned, jobs, interrupted).await
}

/// Run the planned transfers; Ctrl-C cancels whatever has not finished.
async fn run_transfers(
    planned: Vec<Planned>,
    jobs: usize,
    interrupted: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new(jobs));
    for p in &planned {
        scheduler.add(p.task.clone());
    }

    let watcher = {
        let scheduler = scheduler.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling transfers");
                interrupted.store(true, Ordering::SeqCst);
                scheduler.cancel_all();
            }
        })
    };
    let results = scheduler.run_all().await;
    watcher.abort();

    let mut failed = 0usize;
    let mut cancelled = 0usize;
    for (p, result) in planned.iter().zip(results) {
        match result {
            Ok(()) => info!("{}", p.label),
            Err(FileError::Cancelled) => cancelled += 1,
            Err(e) => {
                error!("{}: {e}", p.label);
                failed += 1;
            }
        }
    }

    if cancelled > 0 {
        warn!(count = cancelled, "transfers cancelled");
    }
    if failed > 0 {
        bail!("{failed} of {} transfers failed", planned.len());
    }
    if interrupted.load(Ordering::SeqCst) {
        bail!("interrupted");
    }
    Ok(())
}

pub async fn diff(service: &ServiceConfig, path: &Path) -> anyhow::Result<()> {
    let service = anchored(service)?;
    let remote = remote_file_system(&service)?;
    let local = LocalFileSystem::new();
    let local_path = absolute(path)?;
    let remote_path = service.remote_path_for(&local_path)?;
    let local_path = local_path.to_string_lossy().to_string();

    let report = ops::diff_remote(&local_path, &remote_path, &local, remote.as_ref()).await?;
    let verdict = if report.identical { "identical" } else { "different" };
    println!("{local_path} and {remote_path} are {verdict}");
    println!("remote copy: {}", report.temp_path.display());
    Ok(())
}

pub async fn mkdir(service: &ServiceConfig, path: &str, parents: bool) -> anyhow::Result<()> {
    let remote = remote_file_system(service)?;
    let path = resolve_remote(service, path);
    ops::create_dir(&path, remote.as_ref(), CreateDirOptions { recursive: parents }).await?;
    info!(path = %path, "directory created");
    Ok(())
}

pub async fn rm(service: &ServiceConfig, path: &str, recursive: bool) -> anyhow::Result<()> {
    let remote = remote_file_system(service)?;
    let path = resolve_remote(service, path);
    if recursive {
        ops::remove_dir(&path, remote.as_ref()).await?;
    } else {
        ops::remove_file(&path, remote.as_ref()).await?;
    }
    info!(path = %path, "removed");
    Ok(())
}

pub async fn mv(service: &ServiceConfig, from: &str, to: &str) -> anyhow::Result<()> {
    let remote = remote_file_system(service)?;
    let from = resolve_remote(service, from);
    let to = resolve_remote(service, to);
    ops::rename(&from, &to, remote.as_ref()).await?;
    info!(from = %from, to = %to, "renamed");
    Ok(())
}

pub async fn touch(service: &ServiceConfig, path: &str) -> anyhow::Result<()> {
    let remote = remote_file_system(service)?;
    let path = resolve_remote(service, path);
    ops::create_file(&path, remote.as_ref()).await?;
    info!(path = %path, "file created");
    Ok(())
}

/// Remote paths on the command line may be relative to the service root.
fn resolve_remote(service: &ServiceConfig, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", service.remote_path.trim_end_matches('/'), path)
    }
}

/// `service` with its local root resolved against the working directory.
fn anchored(service: &ServiceConfig) -> anyhow::Result<ServiceConfig> {
    let mut service = service.clone();
    service.context = absolute(Path::new(&service.context))?
        .to_string_lossy()
        .to_string();
    Ok(service)
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Stat times (seconds) as the milliseconds transfer options expect.
fn times_ms(stat: &FileStat) -> (Option<u64>, Option<u64>) {
    (
        stat.atime.map(|s| s.saturating_mul(1000)),
        stat.mtime.map(|s| s.saturating_mul(1000)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::files::FileType;
    use std::io::Write;

    fn service(remote_path: &str) -> ServiceConfig {
        serde_json::from_value(serde_json::json!({
            "protocol": "local",
            "remotePath": remote_path
        }))
        .unwrap()
    }

    #[test]
    fn relative_remote_paths_join_the_root() {
        let svc = service("/srv/www/");
        assert_eq!(resolve_remote(&svc, "css/a.css"), "/srv/www/css/a.css");
        assert_eq!(resolve_remote(&svc, "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn times_are_converted_to_millis() {
        let stat = FileStat {
            file_type: FileType::File,
            mode: 0o644,
            size: 1,
            atime: Some(2),
            mtime: None,
        };
        assert_eq!(times_ms(&stat), (Some(2000), None));
    }

    #[test]
    fn load_service_picks_by_name() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"[{{"name": "a", "protocol": "local", "remotePath": "/a"}},
                {{"name": "b", "protocol": "local", "remotePath": "/b"}}]"#
        )
        .unwrap();
        let svc = load_service(f.path(), Some("b")).unwrap();
        assert_eq!(svc.remote_path, "/b");
        assert!(load_service(f.path(), None).is_err());
    }

    #[tokio::test]
    async fn upload_and_touch_with_local_protocol() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("a.txt"), b"hello").unwrap();

        let svc: ServiceConfig = serde_json::from_value(serde_json::json!({
            "protocol": "local",
            "remotePath": remote.path().to_string_lossy(),
            "context": local.path().to_string_lossy(),
            "useTempFile": true
        }))
        .unwrap();

        upload(&svc, &[local.path().join("a.txt")], 2).await.unwrap();
        assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"hello");

        touch(&svc, "sub.txt").await.unwrap();
        assert!(remote.path().join("sub.txt").exists());
        assert!(touch(&svc, "sub.txt").await.is_err());
    }
}
