//! VMM control abstraction.
//!
//! Separates the boot protocol from the orchestration logic so the
//! lifecycle state machine can run against a fake VMM in tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::ExecutorError;

/// Everything needed to cold-boot a configured VM.
///
/// Paths are as seen by the VMM, i.e. relative to its jail root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel_path: String,
    pub boot_args: String,
    pub rootfs_path: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub tap_device: String,
    pub mac_address: String,
}

/// Snapshot files to restore from, relative to the jail root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    pub snapshot_path: String,
    pub mem_path: String,
}

/// Control-plane operations on a spawned VMM.
///
/// # Cancel Safety
/// Dropping a future mid-way leaves the VMM partially configured; the
/// orchestrator only ever does so on a path that kills the process.
#[async_trait]
pub trait VmmBackend: Send + Sync {
    /// Waits until the control socket accepts connections.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Timeout`] with
    /// [`TimeoutTarget::Socket`](crate::TimeoutTarget::Socket) after `timeout`.
    async fn wait_for_socket(&self, socket: &Path, timeout: Duration) -> Result<(), ExecutorError>;

    /// Sets boot source, root drive, machine shape and network interface,
    /// then starts the instance.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ApiError`] if any call is rejected.
    async fn boot(&self, socket: &Path, config: &BootConfig) -> Result<(), ExecutorError>;

    /// Loads a snapshot and resumes it, in place of [`boot`](Self::boot).
    ///
    /// # Errors
    /// Returns [`ExecutorError::ApiError`] if the load or resume is rejected.
    async fn restore(&self, socket: &Path, snapshot: &RestoreConfig) -> Result<(), ExecutorError>;
}
