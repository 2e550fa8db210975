//! Core types for the husk microVM sandbox manager.
//!
//! Defines the durable VM record, slot-derived network identity, network
//! policy model, and validation of user-supplied options. Nothing in this
//! crate touches the host; see `husk-executor` for that.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod id;
pub mod network;
pub mod record;
pub mod validation;

pub use error::{CoreError, ErrorKind};
pub use id::{SnapshotId, VmId};
pub use network::{Cidr, NetworkIdentity, NetworkPolicy, PolicyRules, Slot};
pub use record::{VmRecord, VmStatus, VmUpdate, DEFAULT_AGENT_PORT};
