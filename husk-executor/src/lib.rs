//! Host-side provisioning and lifecycle orchestration for husk microVMs.
//!
//! Builds each VM's jail, network slot and filter policy, launches
//! Firecracker under the jailer, drives its control API and persists the
//! result. Every host interaction sits behind a trait so the lifecycle
//! can be exercised without root or KVM.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod agent;
pub mod backend;
pub mod command;
pub mod config;
pub mod environment;
pub mod error;
pub mod firecracker;
pub mod guest;
pub mod hooks;
pub mod jail;
pub mod lock;
pub mod network;
pub mod orchestrator;
pub mod pidfile;
pub mod process;
pub mod seccomp;
pub mod store;
pub mod unix_client;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::{BootConfig, RestoreConfig, VmmBackend};
pub use config::{HuskPaths, IsolationOptions, Timeouts};
pub use error::{ErrorReport, ExecutorError, TimeoutTarget};
pub use firecracker::FirecrackerBackend;
pub use hooks::{HookRegistry, LifecycleEvent, LifecycleObserver, Phase};
pub use orchestrator::{CreateOptions, Orchestrator, PolicyUpdate, StopOutcome, VmOutcome};
pub use store::{FileVmStateStore, VmStateStore};
