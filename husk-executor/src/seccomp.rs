//! Seccomp filter provisioning.
//!
//! The VMM needs a compiled BPF program, not the JSON source. Compiled
//! filters are cached under the seccomp directory keyed by the SHA-256 of
//! their source, so editing the source transparently invalidates the cache.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::command::{Cmd, CommandRunner};
use crate::config::HuskPaths;

/// Largest accepted filter source.
pub const MAX_FILTER_BYTES: u64 = 1_048_576;

/// Target architecture accepted by the filter compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompArch {
    X86_64,
    Aarch64,
}

impl SeccompArch {
    /// Architecture of the running host, if supported.
    #[must_use]
    pub fn host() -> Option<Self> {
        std::env::consts::ARCH.parse().ok()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for SeccompArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeccompArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Self::X86_64),
            "aarch64" => Ok(Self::Aarch64),
            other => Err(format!("unsupported seccomp arch: {other} (allowed: x86_64, aarch64)")),
        }
    }
}

/// Compiles and caches the VMM seccomp filter.
#[derive(Debug, Clone)]
pub struct SeccompProvisioner {
    source: PathBuf,
    cache_dir: PathBuf,
    arch: SeccompArch,
    runner: Arc<dyn CommandRunner>,
}

impl SeccompProvisioner {
    #[must_use]
    pub fn new(paths: &HuskPaths, arch: SeccompArch, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            source: paths.seccomp_source(),
            cache_dir: paths.seccomp_dir(),
            arch,
            runner,
        }
    }

    /// Path of a compiled filter for the current source, compiling it if
    /// needed.
    ///
    /// Returns `None`, with a warning, whenever no usable filter can be
    /// produced; the caller then runs the VMM unfiltered.
    #[must_use]
    pub fn ensure(&self) -> Option<PathBuf> {
        let meta = match std::fs::metadata(&self.source) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(source = %self.source.display(), error = %e, "no seccomp filter source");
                return None;
            }
        };
        if meta.len() > MAX_FILTER_BYTES {
            tracing::warn!(
                source = %self.source.display(),
                size = meta.len(),
                max = MAX_FILTER_BYTES,
                "seccomp filter too large; filtering disabled"
            );
            return None;
        }
        let mode = meta.permissions().mode();
        if mode & 0o022 != 0 {
            tracing::warn!(
                source = %self.source.display(),
                mode = format!("{:o}", mode & 0o777),
                "seccomp filter is group/world writable; consider restricting permissions"
            );
        }

        let content = match std::fs::read(&self.source) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(source = %self.source.display(), error = %e, "cannot read seccomp filter");
                return None;
            }
        };
        let compiled = self.cache_dir.join(format!("{}.bpf", source_digest(&content)));
        if compiled.exists() {
            tracing::debug!(filter = %compiled.display(), "using cached seccomp filter");
            return Some(compiled);
        }

        match self.compile(&compiled) {
            Ok(()) => {
                tracing::info!(filter = %compiled.display(), arch = %self.arch, "compiled seccomp filter");
                Some(compiled)
            }
            Err(e) => {
                tracing::warn!(error = %e, "seccomp compilation failed (is seccompiler-bin installed?); filtering disabled");
                None
            }
        }
    }

    fn compile(&self, output: &Path) -> Result<(), crate::ExecutorError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let cmd = Cmd::new("seccompiler-bin").args([
            "--input-file".to_owned(),
            self.source.display().to_string(),
            "--target-arch".to_owned(),
            self.arch.as_str().to_owned(),
            "--output-file".to_owned(),
            output.display().to_string(),
        ]);
        self.runner.run(&cmd).map(drop)
    }
}

/// Lowercase hex SHA-256 of `content`.
fn source_digest(content: &[u8]) -> String {
    Sha256::digest(content).iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    fn setup(source: Option<&[u8]>) -> (tempfile::TempDir, HuskPaths, Arc<RecordingRunner>, SeccompProvisioner) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let paths = HuskPaths::new(dir.path());
        if let Some(content) = source {
            if let Err(e) = std::fs::create_dir_all(paths.seccomp_dir())
                .and_then(|()| std::fs::write(paths.seccomp_source(), content))
                .and_then(|()| std::fs::set_permissions(paths.seccomp_source(), std::fs::Permissions::from_mode(0o644)))
            {
                panic!("fixture: {e}");
            }
        }
        let runner = Arc::new(RecordingRunner::default());
        let prov = SeccompProvisioner::new(&paths, SeccompArch::X86_64, runner.clone());
        (dir, paths, runner, prov)
    }

    #[test]
    fn arch_parsing_accepts_only_supported_targets() {
        assert_eq!("aarch64".parse::<SeccompArch>(), Ok(SeccompArch::Aarch64));
        assert!("riscv64".parse::<SeccompArch>().is_err());
    }

    #[test]
    fn digest_is_stable_hex() {
        assert_eq!(
            source_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_source_yields_no_filter() {
        let (_dir, _paths, runner, prov) = setup(None);
        assert_eq!(prov.ensure(), None);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn compiles_into_digest_keyed_cache() {
        let (_dir, paths, runner, prov) = setup(Some(b"{}"));
        let expected = paths.seccomp_dir().join(format!("{}.bpf", source_digest(b"{}")));
        assert_eq!(prov.ensure(), Some(expected.clone()));

        let log = runner.commands();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("seccompiler-bin --input-file "));
        assert!(log[0].contains("--target-arch x86_64"));
        assert!(log[0].ends_with(&format!("--output-file {}", expected.display())));
    }

    #[test]
    fn cached_filter_skips_compilation() {
        let (_dir, paths, runner, prov) = setup(Some(b"{\"a\":1}"));
        let cached = paths.seccomp_dir().join(format!("{}.bpf", source_digest(b"{\"a\":1}")));
        if let Err(e) = std::fs::write(&cached, b"bpf") {
            panic!("fixture: {e}");
        }
        assert_eq!(prov.ensure(), Some(cached));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn oversized_source_is_rejected() {
        let big = vec![b' '; usize::try_from(MAX_FILTER_BYTES).unwrap_or(usize::MAX) + 1];
        let (_dir, _paths, runner, prov) = setup(Some(&big));
        assert_eq!(prov.ensure(), None);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn compiler_failure_falls_back_to_unfiltered() {
        let (_dir, _paths, runner, prov) = setup(Some(b"{}"));
        runner.fail("seccompiler-bin", "command not found");
        assert_eq!(prov.ensure(), None);
    }
}
