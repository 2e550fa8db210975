//! The persisted per-VM record and its partial-update type.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{SnapshotId, VmId};
use crate::network::NetworkIdentity;

/// Default TCP port of the in-guest agent.
pub const DEFAULT_AGENT_PORT: u16 = 9119;

/// Lifecycle status of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum VmStatus {
    /// Record exists; host resources are being built.
    Creating,
    /// The VMM has been told to start.
    Running,
    /// Process and network resources are torn down.
    Stopped,
    /// An unrecoverable failure occurred; see [`VmRecord::error`].
    Error,
}

impl VmStatus {
    /// Whether a record in this status holds its network slot.
    #[must_use]
    pub fn holds_slot(self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }

    /// Lowercase name as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable description of one VM.
///
/// Serialized as a flat camelCase JSON object, one file per VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub id: VmId,
    #[serde(default)]
    pub project: String,
    /// Runtime label of the root filesystem (e.g. `base`).
    #[serde(default)]
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    pub status: VmStatus,
    pub pid: Option<u32>,
    pub api_socket: PathBuf,
    pub chroot_dir: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub network: NetworkIdentity,
    pub snapshot: Option<SnapshotId>,
    pub timeout_ms: Option<u64>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
    pub agent_token: Option<String>,
    pub agent_port: u16,
}

impl VmRecord {
    /// Whether a `Running` VM has outlived its timeout at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == VmStatus::Running && self.timeout_at.is_some_and(|at| at <= now)
    }
}

/// A partial update applied to a stored [`VmRecord`].
///
/// Outer `None` leaves the field untouched; `Some(None)` clears a nullable
/// field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct VmUpdate {
    pub status: Option<VmStatus>,
    pub pid: Option<Option<u32>>,
    pub error: Option<Option<String>>,
    pub network: Option<NetworkIdentity>,
}

impl VmUpdate {
    /// Sets the status.
    pub fn status(mut self, status: VmStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets or clears the tracked pid.
    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Sets or clears the error message.
    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    /// Replaces the network identity.
    pub fn network(mut self, network: NetworkIdentity) -> Self {
        self.network = Some(network);
        self
    }

    /// Transition to `Error` carrying `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::default().status(VmStatus::Error).error(Some(message.into()))
    }

    /// Merges this update into `record`.
    pub fn apply(self, record: &mut VmRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(pid) = self.pid {
            record.pid = pid;
        }
        if let Some(error) = self.error {
            record.error = error;
        }
        if let Some(network) = self.network {
            record.network = network;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PolicyRules, Slot};

    fn record() -> VmRecord {
        let slot = match Slot::new(4) {
            Ok(s) => s,
            Err(e) => panic!("slot: {e}"),
        };
        VmRecord {
            id: VmId::generate(),
            project: String::new(),
            runtime: "base".to_owned(),
            disk_size_gb: Some(10),
            status: VmStatus::Creating,
            pid: None,
            api_socket: PathBuf::from("/tmp/jail/root/run/firecracker.socket"),
            chroot_dir: PathBuf::from("/tmp/jail"),
            kernel: PathBuf::from("/k/vmlinux"),
            rootfs: PathBuf::from("/r/base.ext4"),
            vcpu_count: 1,
            mem_size_mib: 128,
            network: NetworkIdentity::new(slot, PolicyRules::allow_all(), vec![], None, None),
            snapshot: None,
            timeout_ms: None,
            timeout_at: None,
            created_at: Utc::now(),
            error: None,
            agent_token: None,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }

    #[test]
    fn only_creating_and_running_hold_slots() {
        assert!(VmStatus::Creating.holds_slot());
        assert!(VmStatus::Running.holds_slot());
        assert!(!VmStatus::Stopped.holds_slot());
        assert!(!VmStatus::Error.holds_slot());
    }

    #[test]
    fn update_can_clear_nullable_fields() {
        let mut rec = record();
        rec.pid = Some(42);
        VmUpdate::default().status(VmStatus::Stopped).pid(None).apply(&mut rec);
        assert_eq!(rec.status, VmStatus::Stopped);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.vcpu_count, 1, "untouched fields must survive");
    }

    #[test]
    fn failed_update_sets_error_message() {
        let mut rec = record();
        VmUpdate::failed("boom").apply(&mut rec);
        assert_eq!(rec.status, VmStatus::Error);
        assert_eq!(rec.error.as_deref(), Some("boom"));
    }

    #[test]
    fn record_json_is_flat_camel_case() {
        let rec = record();
        let json = match serde_json::to_value(&rec) {
            Ok(v) => v,
            Err(e) => panic!("serialize: {e}"),
        };
        assert_eq!(json["status"], "creating");
        assert_eq!(json["memSizeMib"], 128);
        assert_eq!(json["agentPort"], 9119);
        assert!(json["pid"].is_null());
        assert_eq!(json["network"]["guestIp"], "172.16.4.2");

        let back: VmRecord = match serde_json::from_value(json) {
            Ok(r) => r,
            Err(e) => panic!("deserialize: {e}"),
        };
        assert_eq!(back, rec);
    }

    #[test]
    fn expiry_requires_running_and_elapsed_deadline() {
        let mut rec = record();
        let now = Utc::now();
        rec.timeout_at = Some(now - chrono::Duration::seconds(1));
        assert!(!rec.is_expired(now), "creating VMs are never reaped");
        rec.status = VmStatus::Running;
        assert!(rec.is_expired(now));
        rec.timeout_at = Some(now + chrono::Duration::seconds(60));
        assert!(!rec.is_expired(now));
    }
}
