use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Maximum length accepted for any identifier that ends up in a path.
const MAX_ID_LEN: usize = 64;

/// Unique identifier for a VM managed by husk (e.g. `vm-1a2b3c4d`).
///
/// IDs are embedded in filesystem paths (state records, chroot directories)
/// and process command lines, so only ASCII alphanumerics, `-` and `_` are
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct VmId(String);

impl VmId {
    /// Generates a new random `VmId` of the form `vm-xxxxxxxx`.
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("vm-{}", &hex[..8]))
    }

    /// Creates a `VmId` after validating its character set.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidId`] if `id` is empty, too long, or
    /// contains characters outside `[A-Za-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.0
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies a stored VM snapshot under `snapshots/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Creates a `SnapshotId` after validating its character set.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidId`] for empty, overlong, or path-unsafe IDs.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

fn validate_id(id: &str) -> Result<(), CoreError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidId { value: id.to_owned() })
    }
}
