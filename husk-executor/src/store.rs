//! Durable VM state records.
//!
//! One flat JSON file per VM (`<vms>/<id>.json`). The store is also where
//! slot allocation is decided, because the answer depends on which records
//! currently hold a slot.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use husk_core::{Slot, VmId, VmRecord, VmUpdate};

use crate::ExecutorError;

/// Keyed storage of [`VmRecord`]s.
pub trait VmStateStore: Send + Sync {
    /// Inserts or replaces a record.
    ///
    /// # Errors
    /// Fails on I/O or encoding errors.
    fn save(&self, record: &VmRecord) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails on I/O or decoding errors; a missing record is `Ok(None)`.
    fn load(&self, id: &VmId) -> Result<Option<VmRecord>, ExecutorError>;

    /// Every record, in no particular order.
    ///
    /// # Errors
    /// Fails if the store cannot be enumerated.
    fn list(&self) -> Result<Vec<VmRecord>, ExecutorError>;

    /// Removes a record; removing an absent record succeeds.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn delete(&self, id: &VmId) -> Result<(), ExecutorError>;

    /// Applies a partial update and returns the new record.
    ///
    /// # Errors
    /// Returns [`ExecutorError::RecordNotFound`] if `id` has no record.
    fn update(&self, id: &VmId, update: VmUpdate) -> Result<VmRecord, ExecutorError> {
        let mut record = self.load(id)?.ok_or_else(|| ExecutorError::RecordNotFound(id.clone()))?;
        update.apply(&mut record);
        self.save(&record)?;
        Ok(record)
    }

    /// Lowest slot not held by a creating/running record nor by a live
    /// interface in `live_interfaces`.
    ///
    /// Must be called under the slot-allocation lock, together with the
    /// save of the record that claims the slot.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SlotsExhausted`] when all 255 are taken.
    fn allocate_slot(&self, live_interfaces: &[String]) -> Result<Slot, ExecutorError> {
        let used = slots_in_use(&self.list()?, live_interfaces);
        find_free_slot(&used).ok_or(ExecutorError::SlotsExhausted)
    }
}

/// Union of slots claimed by records that hold one and slots inferred
/// from interface names.
#[must_use]
pub fn slots_in_use(records: &[VmRecord], live_interfaces: &[String]) -> BTreeSet<Slot> {
    let from_records = records
        .iter()
        .filter(|r| r.status.holds_slot())
        .filter_map(|r| match r.network.slot() {
            Ok(slot) => Some(slot),
            Err(e) => {
                tracing::warn!(vm_id = %r.id, error = %e, "record has no valid slot");
                None
            }
        });
    let from_links = live_interfaces.iter().filter_map(|name| Slot::from_interface_name(name));
    from_records.chain(from_links).collect()
}

/// Lowest slot absent from `used`.
#[must_use]
pub fn find_free_slot(used: &BTreeSet<Slot>) -> Option<Slot> {
    Slot::all().find(|s| !used.contains(s))
}

/// [`VmStateStore`] writing one `0600` JSON file per VM under a `0700`
/// directory.
#[derive(Debug, Clone)]
pub struct FileVmStateStore {
    dir: PathBuf,
}

impl FileVmStateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &VmId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn ensure_dir(&self) -> Result<(), ExecutorError> {
        DirBuilder::new().recursive(true).mode(0o700).create(&self.dir)?;
        std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn read(path: &Path) -> Result<VmRecord, ExecutorError> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|source| ExecutorError::Json { path: path.to_owned(), source })
    }
}

impl VmStateStore for FileVmStateStore {
    fn save(&self, record: &VmRecord) -> Result<(), ExecutorError> {
        self.ensure_dir()?;
        let path = self.record_path(&record.id);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|source| ExecutorError::Json { path: path.clone(), source })?;

        // Write-then-rename so readers never observe a torn record.
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, id: &VmId) -> Result<Option<VmRecord>, ExecutorError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<VmRecord>, ExecutorError> {
        self.ensure_dir()?;
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|e| e == "json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_record {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable state record"),
            }
        }
        Ok(records)
    }

    fn delete(&self, id: &VmId) -> Result<(), ExecutorError> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process [`VmStateStore`].
#[derive(Debug, Default)]
pub struct MemoryVmStateStore {
    records: Mutex<BTreeMap<VmId, VmRecord>>,
}

impl MemoryVmStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<VmId, VmRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VmStateStore for MemoryVmStateStore {
    fn save(&self, record: &VmRecord) -> Result<(), ExecutorError> {
        self.records().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, id: &VmId) -> Result<Option<VmRecord>, ExecutorError> {
        Ok(self.records().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<VmRecord>, ExecutorError> {
        Ok(self.records().values().cloned().collect())
    }

    fn delete(&self, id: &VmId) -> Result<(), ExecutorError> {
        self.records().remove(id);
        Ok(())
    }

    fn update(&self, id: &VmId, update: VmUpdate) -> Result<VmRecord, ExecutorError> {
        let mut records = self.records();
        let record = records.get_mut(id).ok_or_else(|| ExecutorError::RecordNotFound(id.clone()))?;
        update.apply(record);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use husk_core::VmStatus;
    use proptest::prelude::*;

    use super::*;
    use crate::testing::sample_record;

    fn slot(n: u8) -> Slot {
        match Slot::new(n) {
            Ok(s) => s,
            Err(e) => panic!("slot: {e}"),
        }
    }

    fn must<T>(r: Result<T, ExecutorError>) -> T {
        match r {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn file_store_round_trips_with_private_permissions() {
        let dir = must(tempfile::tempdir().map_err(ExecutorError::from));
        let store = FileVmStateStore::new(dir.path().join("vms"));
        let rec = sample_record(slot(0), VmStatus::Creating);
        must(store.save(&rec));

        assert_eq!(must(store.load(&rec.id)), Some(rec.clone()));
        let file_mode = must(std::fs::metadata(store.record_path(&rec.id)).map_err(ExecutorError::from))
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = must(std::fs::metadata(store.dir()).map_err(ExecutorError::from)).permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn update_of_missing_record_fails() {
        let dir = must(tempfile::tempdir().map_err(ExecutorError::from));
        let store = FileVmStateStore::new(dir.path());
        let id = VmId::generate();
        let result = store.update(&id, VmUpdate::default().status(VmStatus::Stopped));
        assert!(matches!(result, Err(ExecutorError::RecordNotFound(ref missing)) if *missing == id));
    }

    #[test]
    fn list_skips_lock_files_and_corrupt_records() {
        let dir = must(tempfile::tempdir().map_err(ExecutorError::from));
        let store = FileVmStateStore::new(dir.path());
        let rec = sample_record(slot(1), VmStatus::Running);
        must(store.save(&rec));
        must(std::fs::write(dir.path().join(".slot-allocation.lock"), b"").map_err(ExecutorError::from));
        must(std::fs::write(dir.path().join("broken.json"), b"{").map_err(ExecutorError::from));

        let listed = must(store.list());
        assert_eq!(listed, vec![rec]);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryVmStateStore::new();
        let rec = sample_record(slot(1), VmStatus::Stopped);
        must(store.save(&rec));
        must(store.delete(&rec.id));
        must(store.delete(&rec.id));
        assert_eq!(must(store.load(&rec.id)), None);
    }

    #[test]
    fn allocation_skips_live_interfaces_and_active_records() {
        let store = MemoryVmStateStore::new();
        must(store.save(&sample_record(slot(0), VmStatus::Running)));
        must(store.save(&sample_record(slot(1), VmStatus::Stopped)));
        must(store.save(&sample_record(slot(2), VmStatus::Creating)));
        let live = vec!["fhvm1".to_owned(), "veth-h-3".to_owned(), "eth0".to_owned()];
        assert_eq!(must(store.allocate_slot(&live)), slot(4));
        assert_eq!(must(store.allocate_slot(&[])), slot(1), "stopped records release their slot");
    }

    #[test]
    fn allocation_fails_when_exhausted() {
        let live: Vec<String> = (0..=254).map(|n| format!("fhvm{n}")).collect();
        let result = MemoryVmStateStore::new().allocate_slot(&live);
        assert!(matches!(result, Err(ExecutorError::SlotsExhausted)));
    }

    proptest! {
        #[test]
        fn proptest_allocation_avoids_every_held_slot(
            held in proptest::collection::btree_set(0u8..=254, 0..60),
            live in proptest::collection::btree_set(0u8..=254, 0..60),
            stopped in proptest::collection::btree_set(0u8..=254, 0..20),
        ) {
            let store = MemoryVmStateStore::new();
            for n in &held {
                must(store.save(&sample_record(slot(*n), VmStatus::Running)));
            }
            for n in &stopped {
                must(store.save(&sample_record(slot(*n), VmStatus::Stopped)));
            }
            let live_names: Vec<String> = live.iter().map(|n| format!("fhvm{n}")).collect();

            let got = must(store.allocate_slot(&live_names));
            prop_assert!(!held.contains(&got.get()));
            prop_assert!(!live.contains(&got.get()));
            let expected = (0u8..=254).find(|n| !held.contains(n) && !live.contains(n));
            prop_assert_eq!(Some(got.get()), expected, "must return the lowest free slot");

            // Claiming the slot makes the next allocation move on.
            must(store.save(&sample_record(got, VmStatus::Creating)));
            if let Ok(next) = store.allocate_slot(&live_names) {
                prop_assert!(next != got);
            }
        }
    }
}
