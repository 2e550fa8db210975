//! Lifecycle observers.
//!
//! The orchestrator emits a [`LifecycleEvent`] at fixed points of every
//! operation. Observers see every event; their failures are logged and
//! never reach the operation that emitted the event.

use std::fmt;
use std::sync::Arc;

use husk_core::{NetworkPolicy, Slot, VmId, VmRecord, VmStatus};

/// Error type observers may return.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Operation during which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Start,
    Stop,
    Remove,
    NetworkPolicy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::NetworkPolicy => "network-policy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleEvent {
    BeforeCreate { vm_id: VmId },
    AfterCreate { record: VmRecord },
    BeforeStart { vm_id: VmId },
    AfterStart { record: VmRecord },
    BeforeStop { vm_id: VmId, status: VmStatus },
    AfterStop { vm_id: VmId, previous: VmStatus },
    BeforeRemove { vm_id: VmId, force: bool },
    AfterRemove { vm_id: VmId },
    Error { vm_id: VmId, phase: Phase, message: String },
    NetworkSetup { vm_id: VmId, slot: Slot, policy: NetworkPolicy },
    NetworkTeardown { vm_id: VmId, slot: Slot },
    PolicyChange { vm_id: VmId, previous: NetworkPolicy, new: NetworkPolicy },
    StateChange { vm_id: VmId, from: VmStatus, to: VmStatus },
}

impl LifecycleEvent {
    /// Stable `scope:name` identifier.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeCreate { .. } => "vm:beforeCreate",
            Self::AfterCreate { .. } => "vm:afterCreate",
            Self::BeforeStart { .. } => "vm:beforeStart",
            Self::AfterStart { .. } => "vm:afterStart",
            Self::BeforeStop { .. } => "vm:beforeStop",
            Self::AfterStop { .. } => "vm:afterStop",
            Self::BeforeRemove { .. } => "vm:beforeRemove",
            Self::AfterRemove { .. } => "vm:afterRemove",
            Self::Error { .. } => "vm:error",
            Self::NetworkSetup { .. } => "network:afterSetup",
            Self::NetworkTeardown { .. } => "network:afterTeardown",
            Self::PolicyChange { .. } => "network:policyChange",
            Self::StateChange { .. } => "state:change",
        }
    }

    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        match self {
            Self::AfterCreate { record } | Self::AfterStart { record } => &record.id,
            Self::BeforeCreate { vm_id }
            | Self::BeforeStart { vm_id }
            | Self::BeforeStop { vm_id, .. }
            | Self::AfterStop { vm_id, .. }
            | Self::BeforeRemove { vm_id, .. }
            | Self::AfterRemove { vm_id }
            | Self::Error { vm_id, .. }
            | Self::NetworkSetup { vm_id, .. }
            | Self::NetworkTeardown { vm_id, .. }
            | Self::PolicyChange { vm_id, .. }
            | Self::StateChange { vm_id, .. } => vm_id,
        }
    }
}

/// Receives lifecycle events.
pub trait LifecycleObserver: Send + Sync {
    /// # Errors
    /// Any error is logged by the registry and otherwise ignored.
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), HookError>;
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) -> Result<(), HookError> + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), HookError> {
        self(event)
    }
}

/// Ordered set of observers.
#[derive(Clone, Default)]
pub struct HookRegistry {
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("observers", &self.observers.len()).finish()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers `event` to every observer in registration order.
    pub fn emit(&self, event: &LifecycleEvent) {
        for observer in &self.observers {
            if let Err(e) = observer.on_event(event) {
                tracing::warn!(hook = event.name(), vm_id = %event.vm_id(), error = %e, "lifecycle hook failed");
            }
        }
    }
}
