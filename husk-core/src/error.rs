//! Validation errors and the error-kind taxonomy shared by all husk crates.

use serde::{Deserialize, Serialize};

/// Broad category of a husk error.
///
/// Every concrete error in the workspace maps to exactly one kind; callers
/// that only care about the category (e.g. HTTP status mapping) match on
/// this instead of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad user input.
    Validation,
    /// Illegal state transition or missing VM.
    Lifecycle,
    /// Jail, network, image or host-tool failure.
    Provisioning,
    /// The VMM control API returned a failure status.
    ControlPlane,
    /// A bounded wait (socket, agent, lock) expired.
    Timeout,
    /// No free network slot.
    ResourceExhaustion,
}

/// Errors produced by the `husk-core` crate.
///
/// All variants are of kind [`ErrorKind::Validation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// An integer flag was malformed or out of range.
    #[error("invalid --{flag}: \"{value}\"; must be an integer between {min} and {max}{unit}")]
    InvalidInteger {
        flag: &'static str,
        value: String,
        min: u64,
        max: u64,
        unit: &'static str,
    },

    /// A published port was not in `1..=65535`.
    #[error("invalid port: {value}")]
    InvalidPort { value: String },

    /// A published port is already claimed by another live VM.
    #[error("published port conflict: {summary}")]
    PortConflict { summary: String },

    /// A domain or domain pattern failed validation.
    #[error("invalid domain pattern \"{domain}\"{detail}")]
    InvalidDomain {
        domain: String,
        /// Extra explanation, already prefixed with `". "` when non-empty.
        detail: String,
    },

    /// A CIDR string failed validation.
    #[error("invalid CIDR \"{cidr}\": {reason}")]
    InvalidCidr { cidr: String, reason: &'static str },

    /// A disk size was malformed or outside `1..=1024` GB.
    #[error("invalid --disk: \"{value}\"; expected an integer between 1gb and 1024gb")]
    InvalidDiskSize { value: String },

    /// A duration string could not be parsed.
    #[error("invalid duration \"{input}\"; use a format like 1h, 30m, 2h30m, or plain minutes")]
    InvalidDuration { input: String },

    /// A network policy name was not recognised.
    #[error("invalid --network-policy: \"{value}\"; must be one of allow-all, deny-all, custom")]
    InvalidNetworkPolicy { value: String },

    /// Two inputs that cannot be combined were both supplied.
    #[error("cannot use {first} and {second} together")]
    MutuallyExclusive {
        first: &'static str,
        second: &'static str,
    },

    /// `deny-all` was combined with allow or deny lists.
    #[error("cannot combine --network-policy deny-all with --allowed-domain, --allowed-cidr, or --denied-cidr")]
    PolicyConflict,

    /// A VM or snapshot identifier contained unsupported characters.
    #[error("invalid identifier \"{value}\"")]
    InvalidId { value: String },

    /// A network slot outside `0..=254`, or an address that does not encode one.
    #[error("invalid network slot: {value}")]
    InvalidSlot { value: String },
}

impl CoreError {
    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInteger { .. } => "ERR_VALIDATION_INTEGER",
            Self::InvalidPort { .. } => "ERR_VALIDATION_PORT",
            Self::PortConflict { .. } => "ERR_VALIDATION_PORT_CONFLICT",
            Self::InvalidDomain { .. } => "ERR_VALIDATION_DOMAIN",
            Self::InvalidCidr { .. } => "ERR_VALIDATION_CIDR",
            Self::InvalidDiskSize { .. } => "ERR_VALIDATION_DISK_SIZE",
            Self::InvalidDuration { .. } => "ERR_VALIDATION_DURATION",
            Self::InvalidNetworkPolicy { .. } => "ERR_VALIDATION_NETWORK_POLICY",
            Self::MutuallyExclusive { .. } => "ERR_VALIDATION_FLAGS",
            Self::PolicyConflict => "ERR_VALIDATION_POLICY_CONFLICT",
            Self::InvalidId { .. } => "ERR_VALIDATION_ID",
            Self::InvalidSlot { .. } => "ERR_VALIDATION_SLOT",
        }
    }

    /// The user-facing flag the error refers to, when there is one.
    #[must_use]
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInteger { flag, .. } => Some(*flag),
            Self::InvalidPort { .. } | Self::PortConflict { .. } => Some("publish-port"),
            Self::InvalidDomain { .. } => Some("allowed-domain"),
            Self::InvalidDiskSize { .. } => Some("disk"),
            Self::InvalidNetworkPolicy { .. } | Self::PolicyConflict => Some("network-policy"),
            Self::InvalidCidr { .. }
            | Self::InvalidDuration { .. }
            | Self::MutuallyExclusive { .. }
            | Self::InvalidId { .. }
            | Self::InvalidSlot { .. } => None,
        }
    }

    /// Always [`ErrorKind::Validation`].
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
