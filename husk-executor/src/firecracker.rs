//! Firecracker VMM backend implementation.
//!
//! Drives a jailed Firecracker process via the Firecracker Management API
//! (HTTP over Unix domain socket).
//!
//! # API Reference
//! Firecracker API reference: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use tokio::net::UnixStream;

use crate::backend::{BootConfig, RestoreConfig, VmmBackend};
use crate::error::TimeoutTarget;
use crate::unix_client::api_request;
use crate::ExecutorError;

/// Guest interface name the TAP device is attached as.
const IFACE_ID: &str = "eth0";

/// Firecracker VMM backend.
#[derive(Debug, Clone)]
pub struct FirecrackerBackend {
    /// Interval between socket readiness probes.
    poll: Duration,
}

impl FirecrackerBackend {
    #[must_use]
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }

    async fn put(socket: &Path, path: &str, body: &serde_json::Value) -> Result<(), ExecutorError> {
        api_request(socket, Method::PUT, path, Some(body.to_string())).await.map(drop)
    }
}

impl Default for FirecrackerBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl VmmBackend for FirecrackerBackend {
    async fn wait_for_socket(&self, socket: &Path, timeout: Duration) -> Result<(), ExecutorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            // The file appears before the VMM listens on it.
            if socket.exists() && UnixStream::connect(socket).await.is_ok() {
                tracing::debug!(socket = %socket.display(), "control socket ready");
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
        Err(ExecutorError::timeout(TimeoutTarget::Socket, socket.display(), timeout))
    }

    async fn boot(&self, socket: &Path, config: &BootConfig) -> Result<(), ExecutorError> {
        Self::put(
            socket,
            "/boot-source",
            &serde_json::json!({
                "kernel_image_path": config.kernel_path,
                "boot_args": config.boot_args,
            }),
        )
        .await?;

        Self::put(
            socket,
            "/drives/rootfs",
            &serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": config.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
                "cache_type": "Unsafe",
                "io_engine": "Sync",
            }),
        )
        .await?;

        Self::put(
            socket,
            "/machine-config",
            &serde_json::json!({
                "vcpu_count": config.vcpu_count,
                "mem_size_mib": config.mem_size_mib,
                "smt": false,
                "track_dirty_pages": false,
            }),
        )
        .await?;

        Self::put(
            socket,
            &format!("/network-interfaces/{IFACE_ID}"),
            &serde_json::json!({
                "iface_id": IFACE_ID,
                "host_dev_name": config.tap_device,
                "guest_mac": config.mac_address,
            }),
        )
        .await?;

        // Every configuration call must land before this one.
        Self::put(socket, "/actions", &serde_json::json!({ "action_type": "InstanceStart" })).await?;

        tracing::info!(socket = %socket.display(), "VM booted");
        Ok(())
    }

    async fn restore(&self, socket: &Path, snapshot: &RestoreConfig) -> Result<(), ExecutorError> {
        Self::put(
            socket,
            "/snapshot/load",
            &serde_json::json!({
                "snapshot_path": snapshot.snapshot_path,
                "mem_file_path": snapshot.mem_path,
            }),
        )
        .await?;

        let resume = serde_json::json!({ "state": "Resumed" });
        api_request(socket, Method::PATCH, "/vm", Some(resume.to_string())).await?;

        tracing::info!(socket = %socket.display(), "VM restored from snapshot");
        Ok(())
    }
}
