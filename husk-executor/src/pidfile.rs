//! Process-id files written by the jail wrapper.

use std::path::{Path, PathBuf};

use crate::process::ProcessTable;
use crate::ExecutorError;

/// A file holding a single decimal pid.
///
/// Reading self-heals: a file naming a dead process is removed and reads
/// as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded pid, if the file exists and the process is alive.
    ///
    /// # Errors
    /// Fails only if the file exists but cannot be read.
    pub fn read(&self, procs: &dyn ProcessTable) -> Result<Option<u32>, ExecutorError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Ok(pid) = raw.trim().parse::<u32>() else {
            tracing::debug!(path = %self.path.display(), "pid file does not hold a pid");
            return Ok(None);
        };
        if procs.is_alive(pid) {
            return Ok(Some(pid));
        }
        tracing::debug!(path = %self.path.display(), pid, "removing stale pid file");
        self.remove();
        Ok(None)
    }

    /// # Errors
    /// Fails if the file cannot be written.
    pub fn write(&self, pid: u32) -> Result<(), ExecutorError> {
        std::fs::write(&self.path, pid.to_string())?;
        Ok(())
    }

    /// Kills the recorded process, if any, and removes the file.
    ///
    /// Returns whether a live process was signalled.
    ///
    /// # Errors
    /// Propagates read and signalling failures.
    pub fn kill(&self, procs: &dyn ProcessTable) -> Result<bool, ExecutorError> {
        let Some(pid) = self.read(procs)? else {
            return Ok(false);
        };
        let killed = procs.kill(pid)?;
        self.remove();
        Ok(killed)
    }

    /// Best-effort removal.
    pub fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "could not remove pid file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProcesses;

    fn pid_file() -> (tempfile::TempDir, PidFile) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let file = PidFile::new(dir.path().join("firecracker.pid"));
        (dir, file)
    }

    #[test]
    fn live_pid_is_returned() {
        let (_dir, file) = pid_file();
        let procs = FakeProcesses::default();
        procs.spawn(4242, "firecracker --id vm-x");
        if let Err(e) = file.write(4242) {
            panic!("write: {e}");
        }
        assert!(matches!(file.read(&procs), Ok(Some(4242))));
    }

    #[test]
    fn dead_pid_removes_the_file() {
        let (_dir, file) = pid_file();
        if let Err(e) = file.write(99) {
            panic!("write: {e}");
        }
        assert!(matches!(file.read(&FakeProcesses::default()), Ok(None)));
        assert!(!file.path().exists(), "stale pid file must be removed");
    }

    #[test]
    fn missing_or_garbage_file_reads_as_absent() {
        let (_dir, file) = pid_file();
        let procs = FakeProcesses::default();
        assert!(matches!(file.read(&procs), Ok(None)));
        if let Err(e) = std::fs::write(file.path(), "not-a-pid") {
            panic!("write: {e}");
        }
        assert!(matches!(file.read(&procs), Ok(None)));
    }

    #[test]
    fn kill_signals_and_removes() {
        let (_dir, file) = pid_file();
        let procs = FakeProcesses::default();
        procs.spawn(7, "jailer --id vm-y");
        if let Err(e) = file.write(7) {
            panic!("write: {e}");
        }
        assert!(matches!(file.kill(&procs), Ok(true)));
        assert!(!procs.is_alive(7));
        assert!(!file.path().exists());
        assert!(matches!(file.kill(&procs), Ok(false)), "second kill is a no-op");
    }
}
