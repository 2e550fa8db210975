//! Error types for the executor crate.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use husk_core::{CoreError, ErrorKind, SnapshotId, VmId, VmStatus};
use serde::Serialize;

/// What a bounded wait was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TimeoutTarget {
    /// The VMM control socket.
    Socket,
    /// The in-guest agent health endpoint.
    Agent,
    /// A cross-process file lock.
    Lock,
}

impl fmt::Display for TimeoutTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Socket => "socket",
            Self::Agent => "agent",
            Self::Lock => "lock",
        })
    }
}

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Invalid user input.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// No VM with this ID exists.
    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    /// An update targeted a state record that does not exist.
    #[error("state record for VM {0} not found")]
    RecordNotFound(VmId),

    /// The operation requires a stopped VM.
    #[error("VM {vm_id} is {status}; it must be stopped first")]
    VmNotStopped { vm_id: VmId, status: VmStatus },

    /// The operation requires a running VM.
    #[error("VM {vm_id} is {status}, not running")]
    VmNotRunning { vm_id: VmId, status: VmStatus },

    /// The jail root of a stopped VM has disappeared.
    #[error("chroot for VM {vm_id} not found at {}", path.display())]
    ChrootNotFound { vm_id: VmId, path: PathBuf },

    /// A requested snapshot is missing one of its files.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    /// A host binary is missing.
    #[error("{name} binary not found at {}", path.display())]
    BinaryNotFound { name: &'static str, path: PathBuf },

    /// No kernel or rootfs image is available.
    #[error("no {what} found in {}", dir.display())]
    ImageNotFound { what: &'static str, dir: PathBuf },

    /// A host command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The jailer refused to start because a device node from a previous
    /// run is still present.
    #[error("stale device node in jail of VM {vm_id}: {detail}")]
    StaleDeviceNode { vm_id: VmId, detail: String },

    /// VM spawn failed for any other reason.
    #[error("VM spawn failed: {0}")]
    SpawnFailed(String),

    /// `ip route show default` produced no `dev` entry.
    #[error("could not determine the host default route interface")]
    DefaultInterfaceNotFound,

    /// A policy update failed and restoring the previous rules failed too.
    #[error("policy update for VM {vm_id} failed ({cause}) and rollback failed ({rollback}); no policy is enforced")]
    PolicyRollbackFailed {
        vm_id: VmId,
        cause: Box<ExecutorError>,
        rollback: Box<ExecutorError>,
    },

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded or encoded.
    #[error("state record {} is invalid: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Firecracker API request returned a failure status.
    #[error("Firecracker API {method} {path} returned {status}: {body}")]
    ApiError {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// An HTTP request could not be delivered.
    #[error("request to {path} failed: {reason}")]
    ApiTransport { path: String, reason: String },

    /// A bounded wait expired.
    #[error("timed out after {}ms waiting for {target} {subject}", after.as_millis())]
    Timeout {
        target: TimeoutTarget,
        subject: String,
        after: Duration,
    },

    /// Every slot in `0..=254` is in use.
    #[error("all 255 network slots are in use")]
    SlotsExhausted,
}

/// Serializable summary of an [`ExecutorError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TimeoutTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutorError {
    /// Broad category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(e) => e.kind(),
            Self::VmNotFound(_)
            | Self::RecordNotFound(_)
            | Self::VmNotStopped { .. }
            | Self::VmNotRunning { .. }
            | Self::ChrootNotFound { .. }
            | Self::SnapshotNotFound(_) => ErrorKind::Lifecycle,
            Self::BinaryNotFound { .. }
            | Self::ImageNotFound { .. }
            | Self::CommandFailed { .. }
            | Self::StaleDeviceNode { .. }
            | Self::SpawnFailed(_)
            | Self::DefaultInterfaceNotFound
            | Self::PolicyRollbackFailed { .. }
            | Self::Io(_)
            | Self::Json { .. } => ErrorKind::Provisioning,
            Self::ApiError { .. } | Self::ApiTransport { .. } => ErrorKind::ControlPlane,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SlotsExhausted => ErrorKind::ResourceExhaustion,
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::VmNotFound(_) => "ERR_VM_NOT_FOUND",
            Self::RecordNotFound(_) => "ERR_VM_STATE_NOT_FOUND",
            Self::VmNotStopped { .. } => "ERR_VM_NOT_STOPPED",
            Self::VmNotRunning { .. } => "ERR_VM_NOT_RUNNING",
            Self::ChrootNotFound { .. } => "ERR_VM_CHROOT_NOT_FOUND",
            Self::SnapshotNotFound(_) => "ERR_SNAPSHOT_NOT_FOUND",
            Self::BinaryNotFound { .. } => "ERR_BINARY_NOT_FOUND",
            Self::ImageNotFound { .. } => "ERR_IMAGE_NOT_FOUND",
            Self::CommandFailed { .. } => "ERR_COMMAND_FAILED",
            Self::StaleDeviceNode { .. } => "ERR_JAILER_STALE_DEVICE",
            Self::SpawnFailed(_) => "ERR_SPAWN_FAILED",
            Self::DefaultInterfaceNotFound => "ERR_NETWORK_DEFAULT_INTERFACE",
            Self::PolicyRollbackFailed { .. } => "ERR_NETWORK_POLICY_ROLLBACK",
            Self::Io(_) => "ERR_IO",
            Self::Json { .. } => "ERR_VM_STATE_CORRUPT",
            Self::ApiError { .. } => "ERR_FIRECRACKER_API",
            Self::ApiTransport { .. } => "ERR_FIRECRACKER_TRANSPORT",
            Self::Timeout { target: TimeoutTarget::Socket, .. } => "ERR_TIMEOUT_SOCKET",
            Self::Timeout { target: TimeoutTarget::Agent, .. } => "ERR_TIMEOUT_AGENT",
            Self::Timeout { target: TimeoutTarget::Lock, .. } => "ERR_TIMEOUT_LOCK",
            Self::SlotsExhausted => "ERR_VM_NETWORK_SLOTS_EXHAUSTED",
        }
    }

    /// The VM this error concerns, when known.
    #[must_use]
    pub fn vm_id(&self) -> Option<&VmId> {
        match self {
            Self::VmNotFound(id) | Self::RecordNotFound(id) => Some(id),
            Self::VmNotStopped { vm_id, .. }
            | Self::VmNotRunning { vm_id, .. }
            | Self::ChrootNotFound { vm_id, .. }
            | Self::StaleDeviceNode { vm_id, .. }
            | Self::PolicyRollbackFailed { vm_id, .. } => Some(vm_id),
            _ => None,
        }
    }

    /// Whether the error means "no such thing" rather than "wrong state".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VmNotFound(_) | Self::RecordNotFound(_) | Self::SnapshotNotFound(_)
        )
    }

    /// Failure signatures after which a single spawn retry is worthwhile.
    ///
    /// Only a socket that never came up, or a leftover device node, qualify;
    /// anything else points at real misconfiguration.
    #[must_use]
    pub fn is_recoverable_spawn_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { target: TimeoutTarget::Socket, .. } | Self::StaleDeviceNode { .. }
        )
    }

    /// Builds the serializable report.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        let (target, timeout_ms) = match self {
            Self::Timeout { target, after, .. } => (
                Some(*target),
                Some(u64::try_from(after.as_millis()).unwrap_or(u64::MAX)),
            ),
            _ => (None, None),
        };
        ErrorReport {
            code: self.code(),
            kind: self.kind(),
            message: self.to_string(),
            vm_id: self.vm_id().map(ToString::to_string),
            flag: match self {
                Self::Validation(e) => e.flag(),
                _ => None,
            },
            target,
            timeout_ms,
        }
    }

    pub(crate) fn timeout(target: TimeoutTarget, subject: impl fmt::Display, after: Duration) -> Self {
        Self::Timeout { target, subject: subject.to_string(), after }
    }
}
