//! Host prerequisites a VM needs before anything is provisioned.

use std::path::{Path, PathBuf};

use husk_core::SnapshotId;

use crate::config::HuskPaths;
use crate::jail::SnapshotFiles;
use crate::ExecutorError;

/// Resolved binaries and images for one create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub snapshot: Option<SnapshotFiles>,
}

impl Environment {
    /// Checks the VMM binaries and picks the kernel, root filesystem and
    /// snapshot files.
    ///
    /// Explicit images must exist; otherwise the lexicographically last
    /// `vmlinux*` and `*.ext4` of the install win.
    ///
    /// # Errors
    /// [`ExecutorError::BinaryNotFound`], [`ExecutorError::ImageNotFound`]
    /// or [`ExecutorError::SnapshotNotFound`].
    pub fn resolve(
        paths: &HuskPaths,
        kernel: Option<&Path>,
        rootfs: Option<&Path>,
        snapshot: Option<&SnapshotId>,
    ) -> Result<Self, ExecutorError> {
        let firecracker_bin = require_binary("firecracker", paths.firecracker_bin())?;
        let jailer_bin = require_binary("jailer", paths.jailer_bin())?;

        let kernel = match kernel {
            Some(path) => require_image("kernel", path)?,
            None => latest_image(&paths.kernels_dir(), |name| name.starts_with("vmlinux"))
                .ok_or_else(|| ExecutorError::ImageNotFound { what: "kernel", dir: paths.kernels_dir() })?,
        };
        let rootfs = match rootfs {
            Some(path) => require_image("rootfs", path)?,
            None => latest_image(&paths.rootfs_dir(), |name| name.ends_with(".ext4"))
                .ok_or_else(|| ExecutorError::ImageNotFound { what: "ext4 rootfs", dir: paths.rootfs_dir() })?,
        };
        let snapshot = snapshot.map(|id| snapshot_files(paths, id)).transpose()?;

        Ok(Self { firecracker_bin, jailer_bin, kernel, rootfs, snapshot })
    }
}

fn require_binary(name: &'static str, path: PathBuf) -> Result<PathBuf, ExecutorError> {
    if path.exists() {
        Ok(path)
    } else {
        Err(ExecutorError::BinaryNotFound { name, path })
    }
}

fn require_image(what: &'static str, path: &Path) -> Result<PathBuf, ExecutorError> {
    if path.is_file() {
        Ok(path.to_owned())
    } else {
        Err(ExecutorError::ImageNotFound { what, dir: path.to_owned() })
    }
}

/// Last matching file name in `dir`, by byte order.
#[must_use]
pub fn latest_image(dir: &Path, matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| matches(name))
        .max()
        .map(|name| dir.join(name))
}

/// Both files of a stored snapshot.
///
/// # Errors
/// Returns [`ExecutorError::SnapshotNotFound`] unless both exist.
pub fn snapshot_files(paths: &HuskPaths, id: &SnapshotId) -> Result<SnapshotFiles, ExecutorError> {
    let dir = paths.snapshot_dir(id);
    let files = SnapshotFiles { snapshot_file: dir.join("snapshot_file"), mem_file: dir.join("mem_file") };
    if files.snapshot_file.exists() && files.mem_file.exists() {
        Ok(files)
    } else {
        Err(ExecutorError::SnapshotNotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install() -> (tempfile::TempDir, HuskPaths) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let paths = HuskPaths::new(dir.path());
        let files = [
            paths.firecracker_bin(),
            paths.jailer_bin(),
            paths.kernels_dir().join("vmlinux-5.10"),
            paths.kernels_dir().join("vmlinux-6.1"),
            paths.kernels_dir().join("readme.txt"),
            paths.rootfs_dir().join("base.ext4"),
            paths.rootfs_dir().join("node22.ext4"),
        ];
        for file in files {
            let created = file
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::write(&file, b"x"));
            if let Err(e) = created {
                panic!("fixture {}: {e}", file.display());
            }
        }
        (dir, paths)
    }

    #[test]
    fn picks_last_sorted_images() {
        let (_dir, paths) = install();
        let env = match Environment::resolve(&paths, None, None, None) {
            Ok(env) => env,
            Err(e) => panic!("resolve: {e}"),
        };
        assert_eq!(env.kernel, paths.kernels_dir().join("vmlinux-6.1"));
        assert_eq!(env.rootfs, paths.rootfs_dir().join("node22.ext4"));
        assert_eq!(env.snapshot, None);
    }

    #[test]
    fn missing_jailer_is_reported() {
        let (_dir, paths) = install();
        if let Err(e) = std::fs::remove_file(paths.jailer_bin()) {
            panic!("fixture: {e}");
        }
        assert!(matches!(
            Environment::resolve(&paths, None, None, None),
            Err(ExecutorError::BinaryNotFound { name: "jailer", .. })
        ));
    }

    #[test]
    fn explicit_image_must_exist() {
        let (_dir, paths) = install();
        let result = Environment::resolve(&paths, Some(Path::new("/nonexistent/vmlinux")), None, None);
        assert!(matches!(result, Err(ExecutorError::ImageNotFound { what: "kernel", .. })), "got {result:?}");
    }

    #[test]
    fn snapshot_needs_both_files() {
        let (_dir, paths) = install();
        let id = match SnapshotId::new("snap-1") {
            Ok(id) => id,
            Err(e) => panic!("id: {e}"),
        };
        let dir = paths.snapshot_dir(&id);
        if let Err(e) = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(dir.join("snapshot_file"), b"s")) {
            panic!("fixture: {e}");
        }
        assert!(matches!(snapshot_files(&paths, &id), Err(ExecutorError::SnapshotNotFound(_))));

        if let Err(e) = std::fs::write(dir.join("mem_file"), b"m") {
            panic!("fixture: {e}");
        }
        match Environment::resolve(&paths, None, None, Some(&id)) {
            Ok(env) => assert_eq!(env.snapshot.map(|s| s.mem_file), Some(dir.join("mem_file"))),
            Err(e) => panic!("resolve: {e}"),
        }
    }
}
