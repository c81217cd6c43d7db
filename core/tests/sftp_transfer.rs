//! Transfers against a live SFTP server.
//!
//! Skips unless a server is reachable (see `common` for the settings).

#![cfg(feature = "sftp")]

mod common;

use std::sync::Arc;

use common::require_sftp;
use ferry_core::backends::remote_file_system;
use ferry_core::config::ServiceConfig;
use ferry_core::files::local::LocalFileSystem;
use ferry_core::files::{FileSystem, FileType, OpenMode};
use ferry_core::ops;
use ferry_core::task::transfer::{FileHandle, TransferDirection, TransferTask};
use ferry_core::task::{Task, TaskState};

const REMOTE_ROOT: &str = "/tmp";

fn service() -> ServiceConfig {
    serde_json::from_value(common::sftp_service_json(REMOTE_ROOT))
        .expect("test service JSON should parse")
}

#[tokio::test]
async fn upload_and_download_round_trip() {
    require_sftp!();

    let config = service();
    let remote = remote_file_system(&config).expect("remote filesystem should build");
    let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let dir = tempfile::tempdir().unwrap();

    let data = common::payload(200 * 1024);
    let local_src = dir.path().join("up.bin").to_string_lossy().to_string();
    std::fs::write(&local_src, &data).unwrap();
    let remote_path = format!("{REMOTE_ROOT}/{}", common::unique_name("ferry-up"));

    let upload = TransferTask::new(
        FileHandle::new(&local_src, local.clone()),
        FileHandle::new(&remote_path, remote.clone()),
        FileType::File,
        TransferDirection::LocalToRemote,
        config.transfer.to_option(Some(1_600_000_000_000), Some(1_600_000_000_000)),
    );
    upload.run().await.expect("upload should succeed");
    assert_eq!(upload.state(), TaskState::Completed);
    assert_eq!(common::read_all(&remote, &remote_path).await, data);

    let local_dest = dir.path().join("down.bin").to_string_lossy().to_string();
    let download = TransferTask::new(
        FileHandle::new(&remote_path, remote.clone()),
        FileHandle::new(&local_dest, local.clone()),
        FileType::File,
        TransferDirection::RemoteToLocal,
        config.transfer.to_option(None, None),
    );
    download.run().await.expect("download should succeed");
    assert_eq!(std::fs::read(&local_dest).unwrap(), data);

    remote.unlink(&remote_path).await.unwrap();
}

#[tokio::test]
async fn staged_upload_with_atomic_rename_preserves_mode() {
    require_sftp!();

    let mut config = service();
    config.transfer.use_temp_file = true;
    config.transfer.open_ssh = true;
    let remote = remote_file_system(&config).unwrap();
    let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let dir = tempfile::tempdir().unwrap();

    let local_src = dir.path().join("page.html").to_string_lossy().to_string();
    std::fs::write(&local_src, b"<h1>new</h1>").unwrap();
    let remote_path = format!("{REMOTE_ROOT}/{}", common::unique_name("ferry-staged"));

    // Existing target with a distinctive mode.
    let fd = remote.open(&remote_path, OpenMode::Write).await.unwrap();
    remote
        .put(
            ferry_core::files::ReadStream::from_bytes(b"old", 1024),
            &remote_path,
            ferry_core::files::PutOptions::with_fd(fd).mode(Some(0o604)),
        )
        .await
        .unwrap();
    remote.close(fd).await.unwrap();

    let task = TransferTask::new(
        FileHandle::new(&local_src, local),
        FileHandle::new(&remote_path, remote.clone()),
        FileType::File,
        TransferDirection::LocalToRemote,
        config.transfer.to_option(None, None),
    );
    task.run().await.expect("staged upload should succeed");

    assert_eq!(common::read_all(&remote, &remote_path).await, b"<h1>new</h1>");
    assert_eq!(remote.lstat(&remote_path).await.unwrap().mode, 0o604);
    assert!(remote
        .lstat(&format!("{remote_path}.new"))
        .await
        .unwrap_err()
        .is_not_found());

    remote.unlink(&remote_path).await.unwrap();
}

#[tokio::test]
async fn create_file_and_dir_operations() {
    require_sftp!();

    let remote = remote_file_system(&service()).unwrap();
    let root = format!("{REMOTE_ROOT}/{}", common::unique_name("ferry-ops"));

    ops::create_dir(
        &format!("{root}/x/y"),
        remote.as_ref(),
        ops::CreateDirOptions { recursive: true },
    )
    .await
    .unwrap();
    assert!(remote.lstat(&format!("{root}/x/y")).await.unwrap().is_dir());

    let file = format!("{root}/x/y/empty.txt");
    ops::create_file(&file, remote.as_ref()).await.unwrap();
    assert!(ops::create_file(&file, remote.as_ref())
        .await
        .unwrap_err()
        .is_already_exists());

    remote.symlink("empty.txt", &format!("{root}/x/y/link")).await.unwrap();
    assert!(remote
        .symlink("empty.txt", &format!("{root}/x/y/link"))
        .await
        .unwrap_err()
        .is_already_exists());

    ops::remove_dir(&root, remote.as_ref()).await.unwrap();
    assert!(remote.lstat(&root).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn repeated_symlink_and_mkdir_collisions_are_already_exists() {
    require_sftp!();

    let remote = remote_file_system(&service()).unwrap();
    let root = format!("{REMOTE_ROOT}/{}", common::unique_name("ferry-collide"));
    remote.mkdir(&root).await.unwrap();

    // Servers answer these collisions with a bare failure status.
    assert!(remote.mkdir(&root).await.unwrap_err().is_already_exists());
    let nested = format!("{root}/a/b");
    for _ in 0..2 {
        ops::create_dir(
            &nested,
            remote.as_ref(),
            ops::CreateDirOptions { recursive: true },
        )
        .await
        .expect("recursive create_dir should tolerate existing parents");
    }

    let source_link = format!("{root}/source-link");
    let copied_link = format!("{root}/a/copied-link");
    remote.symlink("../target.txt", &source_link).await.unwrap();
    for attempt in 1..=2 {
        ops::transfer_symlink(&source_link, &copied_link, remote.as_ref(), remote.as_ref())
            .await
            .unwrap_or_else(|e| panic!("symlink transfer #{attempt} failed: {e}"));
    }
    assert!(remote.lstat(&copied_link).await.unwrap().is_symlink());
    assert_eq!(remote.readlink(&copied_link).await.unwrap(), "../target.txt");

    ops::remove_dir(&root, remote.as_ref()).await.unwrap();
}
