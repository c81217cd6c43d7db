//! Shared helpers for ferry-core integration tests.
//!
//! SFTP tests talk to a real server. Point them at one with
//! `FERRY_SFTP_HOST` / `FERRY_SFTP_PORT` (default `127.0.0.1:2222`, user
//! `testuser` / `testpass`); they skip when nothing is listening.

// Each integration test is its own crate and uses a different subset.
#![allow(dead_code)]

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ferry_core::files::FileSystem;

pub const DEFAULT_SFTP_PORT: u16 = 2222;

/// Whether a TCP connection to `host:port` succeeds within 2 seconds.
pub fn is_port_reachable(host: &str, port: u16) -> bool {
    let Ok(mut addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

pub fn sftp_host() -> String {
    std::env::var("FERRY_SFTP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn sftp_port() -> u16 {
    std::env::var("FERRY_SFTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_SFTP_PORT)
}

/// Skip the current test when no SFTP server is reachable.
macro_rules! require_sftp {
    () => {
        if !common::is_port_reachable(&common::sftp_host(), common::sftp_port()) {
            eprintln!(
                "SKIPPED: no SFTP server on {}:{} (set FERRY_SFTP_HOST / FERRY_SFTP_PORT)",
                common::sftp_host(),
                common::sftp_port()
            );
            return;
        }
    };
}
pub(crate) use require_sftp;

/// Service JSON for the test server with password login.
pub fn sftp_service_json(remote_path: &str) -> serde_json::Value {
    serde_json::json!({
        "name": "test",
        "protocol": "sftp",
        "host": sftp_host(),
        "port": sftp_port(),
        "username": "testuser",
        "authMethod": "password",
        "password": "testpass",
        "remotePath": remote_path
    })
}

/// A path component unique to this test run.
pub fn unique_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}-{}-{nanos}", std::process::id())
}

/// Pseudo-random payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub async fn read_all(fs: &Arc<dyn FileSystem>, path: &str) -> Vec<u8> {
    fs.read_file(path).await.expect("read back should succeed")
}
