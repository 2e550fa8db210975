//! Process discovery and signalling.
//!
//! The tracked pid in a VM record can go stale (crash, manual kill, a
//! jailer that re-parented its child), so every stop path also scans the
//! process table for command lines naming both a marker binary and the VM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use husk_core::VmId;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::command::{Cmd, CommandRunner};
use crate::ExecutorError;

/// Marker identifying the VMM process.
pub const VMM_MARKER: &str = "firecracker";
/// Marker identifying the jail wrapper process.
pub const JAILER_MARKER: &str = "jailer";

/// How long a process gets to exit after SIGTERM before it is killed.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Host process table operations.
pub trait ProcessTable: Send + Sync {
    /// First process whose executable name starts with `marker` and whose
    /// arguments name `vm_id`.
    fn find(&self, marker: &str, vm_id: &VmId) -> Option<u32>;

    /// Sends SIGTERM, then SIGKILL if the process outlives the grace
    /// period. Returns `false` if the process did not exist.
    ///
    /// # Errors
    /// Fails only if signalling was refused and the privileged fallback
    /// could not be started.
    fn kill(&self, pid: u32) -> Result<bool, ExecutorError>;

    /// Whether `pid` exists (a process owned by another user counts).
    fn is_alive(&self, pid: u32) -> bool;
}

/// Whether `argv` is `marker`'s process for `vm_id`.
///
/// Only the basename of `argv[0]` is compared against the marker, so a
/// wrapper such as `sudo` or the jailer whose arguments mention the VMM
/// binary is not mistaken for the VMM itself.
#[must_use]
pub fn is_vm_process<S: AsRef<str>>(argv: &[S], marker: &str, vm_id: &VmId) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    let name = Path::new(program.as_ref()).file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with(marker) && args.iter().any(|a| a.as_ref().contains(vm_id.as_str()))
}

/// [`ProcessTable`] reading `/proc` and signalling with `kill(2)`.
#[derive(Debug, Clone)]
pub struct ProcScanner {
    proc_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    grace: Duration,
}

impl ProcScanner {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { proc_root: PathBuf::from("/proc"), runner, grace: TERM_GRACE }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn signal(pid: u32, sig: Option<Signal>) -> Result<(), Errno> {
        let pid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        signal::kill(Pid::from_raw(pid), sig)
    }

    /// Polls until `pid` is gone or the grace period ends.
    fn exited_within_grace(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            std::thread::sleep(EXIT_POLL);
        }
        !self.is_alive(pid)
    }

    fn sudo_kill(&self, pid: u32, sig: &str) -> Result<bool, ExecutorError> {
        let out = self.runner.output(&Cmd::sudo("kill").args([sig.to_owned(), pid.to_string()]))?;
        Ok(out.success())
    }
}

impl ProcessTable for ProcScanner {
    fn find(&self, marker: &str, vm_id: &VmId) -> Option<u32> {
        let entries = std::fs::read_dir(&self.proc_root).ok()?;
        entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .find(|pid| {
                // Processes may exit between listing and reading.
                std::fs::read(self.proc_root.join(pid.to_string()).join("cmdline"))
                    .map(|raw| {
                        let cmdline = String::from_utf8_lossy(&raw);
                        let argv: Vec<&str> = cmdline.split('\0').filter(|a| !a.is_empty()).collect();
                        is_vm_process(&argv, marker, vm_id)
                    })
                    .unwrap_or(false)
            })
    }

    fn kill(&self, pid: u32) -> Result<bool, ExecutorError> {
        match Self::signal(pid, Some(Signal::SIGTERM)) {
            Ok(()) => {
                if !self.exited_within_grace(pid) {
                    tracing::debug!(pid, "process ignored SIGTERM; sending SIGKILL");
                    match Self::signal(pid, Some(Signal::SIGKILL)) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => return Err(std::io::Error::from(e).into()),
                    }
                }
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => {
                if !self.sudo_kill(pid, "-TERM")? {
                    return Ok(false);
                }
                if !self.exited_within_grace(pid) {
                    self.sudo_kill(pid, "-KILL")?;
                }
                Ok(true)
            }
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        matches!(Self::signal(pid, None), Ok(()) | Err(Errno::EPERM))
    }
}
