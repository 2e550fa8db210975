//! Installation layout, isolation switches, and bounded-wait settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use husk_core::{SnapshotId, VmId, DEFAULT_AGENT_PORT};

/// Environment variable overriding the installation directory.
pub const HOME_ENV: &str = "HUSK_HOME";

/// Resolved per-installation directory layout.
///
/// ```text
/// <base>/
///   vms/            state records + dot-prefixed lock files
///   jailer/         chroot base handed to the jailer
///   bin/            firecracker, jailer, husk-agent, seccompiler-bin
///   kernels/        vmlinux*
///   rootfs/         *.ext4
///   snapshots/<id>/ snapshot_file, mem_file
///   seccomp/        default.json + compiled filters
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct HuskPaths {
    base: PathBuf,
    /// TCP port the in-guest agent listens on.
    pub agent_port: u16,
}

impl HuskPaths {
    /// Layout rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into(), agent_port: DEFAULT_AGENT_PORT }
    }

    /// Layout rooted at `$HUSK_HOME`, else `~/.husk`.
    #[must_use]
    pub fn from_env() -> Self {
        if let Some(base) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(base);
        }
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/root"), PathBuf::from);
        Self::new(home.join(".husk"))
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn vms_dir(&self) -> PathBuf {
        self.base.join("vms")
    }

    #[must_use]
    pub fn jailer_dir(&self) -> PathBuf {
        self.base.join("jailer")
    }

    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.base.join("bin")
    }

    #[must_use]
    pub fn kernels_dir(&self) -> PathBuf {
        self.base.join("kernels")
    }

    #[must_use]
    pub fn rootfs_dir(&self) -> PathBuf {
        self.base.join("rootfs")
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    #[must_use]
    pub fn seccomp_dir(&self) -> PathBuf {
        self.base.join("seccomp")
    }

    #[must_use]
    pub fn firecracker_bin(&self) -> PathBuf {
        self.bin_dir().join("firecracker")
    }

    #[must_use]
    pub fn jailer_bin(&self) -> PathBuf {
        self.bin_dir().join("jailer")
    }

    #[must_use]
    pub fn agent_bin(&self) -> PathBuf {
        self.bin_dir().join("husk-agent")
    }

    /// Source filter compiled into BPF on demand.
    #[must_use]
    pub fn seccomp_source(&self) -> PathBuf {
        self.seccomp_dir().join("default.json")
    }

    /// Directory holding the two files of one snapshot.
    #[must_use]
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.as_str())
    }

    /// Lock serialising slot allocation across processes.
    #[must_use]
    pub fn slot_lock(&self) -> PathBuf {
        self.vms_dir().join(".slot-allocation.lock")
    }

    /// Lock serialising policy updates on one VM.
    #[must_use]
    pub fn policy_lock(&self, id: &VmId) -> PathBuf {
        self.vms_dir().join(format!(".{id}.policy.lock"))
    }
}

/// Which isolation layers a VM is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct IsolationOptions {
    /// Place the TAP device in a dedicated network namespace.
    pub netns: bool,
    /// Run the VMM under a compiled seccomp filter.
    pub seccomp: bool,
    /// Start the jailer in a new PID namespace.
    pub pid_ns: bool,
    /// Apply cgroup CPU and memory limits.
    pub cgroup: bool,
}

impl Default for IsolationOptions {
    fn default() -> Self {
        Self { netns: true, seccomp: true, pid_ns: true, cgroup: true }
    }
}

impl IsolationOptions {
    /// Everything off, for hosts without namespace or cgroup support.
    #[must_use]
    pub fn none() -> Self {
        Self { netns: false, seccomp: false, pid_ns: false, cgroup: false }
    }
}

/// Bounded waits used by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// First wait for the VMM control socket.
    pub socket: Duration,
    /// Wait for the control socket on the single retry after a recoverable failure.
    pub socket_retry: Duration,
    /// Control socket poll interval.
    pub socket_poll: Duration,
    /// Wait for the in-guest agent.
    pub agent: Duration,
    /// Agent health poll interval.
    pub agent_poll: Duration,
    /// Attempts before a file lock acquisition times out.
    pub lock_retries: u32,
    /// Delay between lock attempts.
    pub lock_retry_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            socket: Duration::from_secs(5),
            socket_retry: Duration::from_secs(15),
            socket_poll: Duration::from_millis(100),
            agent: Duration::from_secs(60),
            agent_poll: Duration::from_millis(500),
            lock_retries: 600,
            lock_retry_interval: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_base() {
        let paths = HuskPaths::new("/srv/husk");
        assert_eq!(paths.vms_dir(), PathBuf::from("/srv/husk/vms"));
        assert_eq!(paths.firecracker_bin(), PathBuf::from("/srv/husk/bin/firecracker"));
        assert_eq!(paths.slot_lock(), PathBuf::from("/srv/husk/vms/.slot-allocation.lock"));
        assert_eq!(paths.agent_port, 9119);
    }

    #[test]
    fn policy_lock_is_dot_prefixed_per_vm() {
        let paths = HuskPaths::new("/srv/husk");
        let id = match VmId::new("vm-0000abcd") {
            Ok(id) => id,
            Err(e) => panic!("valid id rejected: {e}"),
        };
        assert_eq!(
            paths.policy_lock(&id),
            PathBuf::from("/srv/husk/vms/.vm-0000abcd.policy.lock")
        );
    }

    #[test]
    fn retry_socket_wait_is_longer_than_first() {
        let t = Timeouts::default();
        assert!(t.socket_retry > t.socket);
        assert_eq!(t.lock_retry_interval * t.lock_retries, Duration::from_secs(30));
    }
}
