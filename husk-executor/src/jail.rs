//! Jail provisioning: the chroot the VMM runs in, and the wrapper that
//! launches it there.
//!
//! [`Jailer`] drives the Firecracker `jailer` binary plus the ext4 tools
//! needed to grow and patch a per-VM root filesystem. Everything that
//! touches a mounted guest filesystem goes through `sudo`, because the
//! image's files are owned by root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use husk_core::VmId;

use crate::command::{Cmd, CommandRunner};
use crate::guest;
use crate::ExecutorError;

/// Extra cgroup memory for the VMM process beyond guest RAM.
pub const VMM_OVERHEAD_MIB: u64 = 64;
/// CFS period used for the CPU quota.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Kernel path as seen from inside the jail.
pub const JAIL_KERNEL: &str = "kernel/vmlinux";
/// Root drive path as seen from inside the jail.
pub const JAIL_ROOTFS: &str = "rootfs/rootfs.ext4";
/// Control socket path as seen from inside the jail.
pub const JAIL_SOCKET: &str = "run/firecracker.socket";
/// Snapshot state file as seen from inside the jail.
pub const JAIL_SNAPSHOT_FILE: &str = "snapshot/snapshot_file";
/// Snapshot memory file as seen from inside the jail.
pub const JAIL_MEM_FILE: &str = "snapshot/mem_file";

const GIB: u64 = 1024 * 1024 * 1024;

/// Host-side layout of one VM's jail.
///
/// The jailer chroots into `<base>/firecracker/<id>/root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailPaths {
    pub chroot_base: PathBuf,
    /// `<base>/firecracker/<id>`; owned exclusively by this VM.
    pub jail_dir: PathBuf,
    /// The chroot itself.
    pub root_dir: PathBuf,
}

impl JailPaths {
    #[must_use]
    pub fn new(chroot_base: &Path, vm_id: &VmId) -> Self {
        let jail_dir = chroot_base.join("firecracker").join(vm_id.as_str());
        let root_dir = jail_dir.join("root");
        Self { chroot_base: chroot_base.to_owned(), jail_dir, root_dir }
    }

    /// Rebuilds the layout from a persisted chroot directory.
    #[must_use]
    pub fn from_root(root_dir: &Path) -> Option<Self> {
        let jail_dir = root_dir.parent()?;
        let chroot_base = jail_dir.parent()?.parent()?;
        Some(Self {
            chroot_base: chroot_base.to_owned(),
            jail_dir: jail_dir.to_owned(),
            root_dir: root_dir.to_owned(),
        })
    }

    #[must_use]
    pub fn kernel(&self) -> PathBuf {
        self.root_dir.join(JAIL_KERNEL)
    }

    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.root_dir.join(JAIL_ROOTFS)
    }

    #[must_use]
    pub fn socket(&self) -> PathBuf {
        self.root_dir.join(JAIL_SOCKET)
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.root_dir.join("snapshot")
    }

    /// Written by the jailer when it daemonizes the VMM.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root_dir.join("firecracker.pid")
    }

    /// Device nodes the jailer creates on every spawn.
    #[must_use]
    pub fn dev_dir(&self) -> PathBuf {
        self.root_dir.join("dev")
    }

    fn mount_point(&self) -> PathBuf {
        self.root_dir.join("tmp-mount")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root_dir.join(".staging")
    }
}

/// Snapshot files copied into the jail for a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFiles {
    pub snapshot_file: PathBuf,
    pub mem_file: PathBuf,
}

/// In-guest agent to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInjection {
    pub binary: PathBuf,
    pub token: String,
    pub port: u16,
}

/// What [`JailBackend::prepare`] puts into the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub vm_id: VmId,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub disk_size_gb: Option<u32>,
    pub snapshot: Option<SnapshotFiles>,
    /// Ports the demo page listens on; `None` skips the page.
    pub welcome_ports: Option<Vec<u16>>,
    pub agent: Option<AgentInjection>,
}

/// Cgroup limits applied to the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub memory_bytes: u64,
}

impl CgroupLimits {
    /// One full CPU per vCPU, guest memory plus [`VMM_OVERHEAD_MIB`].
    #[must_use]
    pub fn for_vm(vcpus: u32, mem_mib: u32) -> Self {
        Self {
            cpu_quota_us: u64::from(vcpus) * CPU_PERIOD_US,
            cpu_period_us: CPU_PERIOD_US,
            memory_bytes: (u64::from(mem_mib) + VMM_OVERHEAD_MIB) * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    /// v2 when the unified hierarchy exposes `cgroup.controllers`.
    #[must_use]
    pub fn detect(cgroup_root: &Path) -> Self {
        if cgroup_root.join("cgroup.controllers").exists() {
            Self::V2
        } else {
            Self::V1
        }
    }
}

/// How the VMM is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub seccomp_filter: Option<PathBuf>,
    pub new_pid_ns: bool,
    pub cgroup: Option<CgroupLimits>,
    pub netns: Option<String>,
}

/// Builds and launches VMM jails.
pub trait JailBackend: Send + Sync {
    /// Creates the chroot tree and populates it.
    ///
    /// # Errors
    /// Fails on any filesystem or image-tool error. The caller owns
    /// cleanup via [`remove`](Self::remove).
    fn prepare(&self, paths: &JailPaths, request: &PrepareRequest) -> Result<(), ExecutorError>;

    /// Launches the VMM under the jail wrapper; returns once it has
    /// daemonized.
    ///
    /// # Errors
    /// Returns [`ExecutorError::StaleDeviceNode`] when the wrapper refused
    /// to run because device nodes from an earlier run remain, and
    /// [`ExecutorError::SpawnFailed`] for every other failure.
    fn spawn(&self, vm_id: &VmId, paths: &JailPaths, request: &SpawnRequest) -> Result<(), ExecutorError>;

    /// Removes the control socket, pid file and device nodes of a previous
    /// run.
    ///
    /// # Errors
    /// Fails if an artifact exists and cannot be removed.
    fn clear_stale(&self, paths: &JailPaths) -> Result<(), ExecutorError>;

    /// Removes every device tree and runtime directory in the jail, even
    /// ones held by a dead process's lingering mounts.
    ///
    /// # Errors
    /// Fails if removal fails.
    fn force_clear_devices(&self, paths: &JailPaths) -> Result<(), ExecutorError>;

    /// Deletes the chroot and the per-VM jail directory. Best-effort.
    fn remove(&self, paths: &JailPaths);
}

/// [`JailBackend`] using the Firecracker `jailer` and e2fsprogs.
#[derive(Debug, Clone)]
pub struct Jailer {
    runner: Arc<dyn CommandRunner>,
    cgroup_root: PathBuf,
}

impl Jailer {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner, cgroup_root: PathBuf::from("/sys/fs/cgroup") }
    }

    fn sudo<I, S>(&self, program: &str, args: I) -> Result<String, ExecutorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&Cmd::sudo(program).args(args))
    }

    /// Grows the image to `gib` if it is smaller.
    ///
    /// Order matters: resize2fs on an unchecked filesystem can corrupt it.
    fn grow_rootfs(&self, rootfs: &Path, gib: u32) -> Result<(), ExecutorError> {
        let target = u64::from(gib) * GIB;
        let current = std::fs::metadata(rootfs)?.len();
        if target <= current {
            return Ok(());
        }
        tracing::info!(rootfs = %rootfs.display(), from = current, to = target, "growing root filesystem");

        std::fs::OpenOptions::new().write(true).open(rootfs)?.set_len(target)?;

        let image = rootfs.display().to_string();
        let fsck = Cmd::sudo("e2fsck").args(["-fy", image.as_str()]);
        let out = self.runner.output(&fsck)?;
        // 1 and 2 mean errors were corrected; 4 and up mean they were not.
        if out.code.is_none_or(|code| code >= 4) {
            return Err(out.into_error(&fsck));
        }
        self.sudo("resize2fs", [image.as_str()])?;
        self.sudo("tune2fs", ["-m", "0", image.as_str()])?;
        Ok(())
    }

    /// Writes `content` to `dest` inside the mounted image.
    fn install_file(&self, paths: &JailPaths, dest: &Path, content: &str, mode: &str) -> Result<(), ExecutorError> {
        let staging = paths.staging_dir();
        std::fs::create_dir_all(&staging)?;
        let name = dest.file_name().map_or_else(|| "file".into(), |n| n.to_string_lossy().into_owned());
        let staged = staging.join(name);
        std::fs::write(&staged, content)?;
        let (src, dst) = (staged.display().to_string(), dest.display().to_string());
        self.sudo("install", ["-D", "-m", mode, src.as_str(), dst.as_str()]).map(drop)
    }

    fn enable_unit(&self, mount: &Path, unit: &str) -> Result<(), ExecutorError> {
        let wants = mount.join(guest::WANTS_DIR);
        self.sudo("mkdir", ["-p".to_owned(), wants.display().to_string()])?;
        self.sudo(
            "ln",
            [
                "-sf".to_owned(),
                format!("/{}/{unit}", guest::SYSTEMD_DIR),
                wants.join(unit).display().to_string(),
            ],
        )
        .map(drop)
    }

    /// Everything done to the mounted image.
    fn inject(&self, paths: &JailPaths, mount: &Path, request: &PrepareRequest) -> Result<(), ExecutorError> {
        // The kernel's ip= autoconfiguration publishes the resolver here.
        let resolv = mount.join("etc/resolv.conf").display().to_string();
        self.sudo("rm", ["-f", resolv.as_str()])?;
        self.sudo("ln", ["-s", "/proc/net/pnp", resolv.as_str()])?;

        if let Some(ports) = &request.welcome_ports {
            let dir = mount.join(guest::WELCOME_DIR);
            self.install_file(paths, &dir.join("index.html"), &guest::welcome_html(&request.vm_id, ports), "0644")?;
            self.install_file(paths, &dir.join("server.js"), &guest::welcome_server(ports), "0644")?;
            let unit = mount.join(guest::SYSTEMD_DIR).join(guest::WELCOME_UNIT);
            self.install_file(paths, &unit, &guest::welcome_service(ports), "0644")?;
            self.enable_unit(mount, guest::WELCOME_UNIT)?;
        }

        if let Some(agent) = &request.agent {
            let (src, bin) = (agent.binary.display().to_string(), mount.join(guest::AGENT_BIN).display().to_string());
            self.sudo("install", ["-D", "-m", "0755", src.as_str(), bin.as_str()])?;
            let env = guest::agent_env(&agent.token, agent.port, &request.vm_id);
            self.install_file(paths, &mount.join(guest::AGENT_ENV), &env, "0600")?;
            let unit = mount.join(guest::SYSTEMD_DIR).join(guest::AGENT_UNIT);
            self.install_file(paths, &unit, &guest::agent_service(), "0644")?;
            self.enable_unit(mount, guest::AGENT_UNIT)?;
        }
        Ok(())
    }

    /// Mounts the image, injects, and always unmounts.
    fn patch_rootfs(&self, paths: &JailPaths, request: &PrepareRequest) -> Result<(), ExecutorError> {
        let mount = paths.mount_point();
        std::fs::create_dir_all(&mount)?;
        let mount_str = mount.display().to_string();

        let image = paths.rootfs().display().to_string();
        self.sudo("mount", ["-o", "loop", image.as_str(), mount_str.as_str()])?;
        let injected = self.inject(paths, &mount, request);

        let unmounted = self.sudo("umount", [mount_str.as_str()]);
        if let Err(e) = &unmounted {
            tracing::warn!(mount = %mount_str, error = %e, "unmount of guest image failed");
        }
        // Non-recursive: if the unmount failed the guest image is still there.
        if let Err(e) = std::fs::remove_dir(&mount) {
            tracing::debug!(dir = %mount_str, error = %e, "mount point not removed");
        }
        if let Err(e) = std::fs::remove_dir_all(paths.staging_dir()) {
            tracing::debug!(error = %e, "staging directory not removed");
        }
        injected?;
        unmounted.map(drop)
    }

    fn remove_path(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        if std::fs::remove_dir_all(path).is_ok() {
            return;
        }
        // Jailer-created files are root owned.
        if let Err(e) = self.sudo("rm", ["-rf".to_owned(), path.display().to_string()]) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove jail directory");
        }
    }
}

/// Full `jailer` argument vector, without the leading binary.
#[must_use]
pub fn jailer_args(vm_id: &VmId, paths: &JailPaths, request: &SpawnRequest, cgroups: CgroupVersion) -> Vec<String> {
    let mut args = vec![
        "--exec-file".to_owned(),
        request.firecracker_bin.display().to_string(),
        "--id".to_owned(),
        vm_id.to_string(),
        "--uid".to_owned(),
        request.uid.to_string(),
        "--gid".to_owned(),
        request.gid.to_string(),
        "--chroot-base-dir".to_owned(),
        paths.chroot_base.display().to_string(),
        "--daemonize".to_owned(),
    ];
    if request.new_pid_ns {
        args.push("--new-pid-ns".to_owned());
    }
    if let Some(ns) = &request.netns {
        args.extend(["--netns".to_owned(), format!("/var/run/netns/{ns}")]);
    }
    if let Some(limits) = request.cgroup {
        let settings = match cgroups {
            CgroupVersion::V2 => {
                args.extend(["--cgroup-version".to_owned(), "2".to_owned()]);
                vec![
                    format!("cpu.max={} {}", limits.cpu_quota_us, limits.cpu_period_us),
                    format!("memory.max={}", limits.memory_bytes),
                ]
            }
            CgroupVersion::V1 => vec![
                format!("cpu.cfs_quota_us={}", limits.cpu_quota_us),
                format!("cpu.cfs_period_us={}", limits.cpu_period_us),
                format!("memory.limit_in_bytes={}", limits.memory_bytes),
            ],
        };
        for setting in settings {
            args.extend(["--cgroup".to_owned(), setting]);
        }
    }

    args.extend(["--".to_owned(), "--api-sock".to_owned(), JAIL_SOCKET.to_owned()]);
    match &request.seccomp_filter {
        Some(filter) if filter.exists() => {
            args.extend(["--seccomp-filter".to_owned(), filter.display().to_string()]);
        }
        _ => args.push("--no-seccomp".to_owned()),
    }
    args
}

/// Whether jailer output reports an already-existing device node.
fn is_stale_device_failure(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("os error 17")
}

impl JailBackend for Jailer {
    fn prepare(&self, paths: &JailPaths, request: &PrepareRequest) -> Result<(), ExecutorError> {
        tracing::info!(vm_id = %request.vm_id, root = %paths.root_dir.display(), "preparing jail");
        for dir in ["kernel", "rootfs", "run"] {
            std::fs::create_dir_all(paths.root_dir.join(dir))?;
        }

        let kernel = paths.kernel();
        if !kernel.exists() {
            if let Err(e) = std::fs::hard_link(&request.kernel, &kernel) {
                // Different filesystems cannot share the inode.
                tracing::debug!(error = %e, "kernel hard link failed; copying");
                std::fs::copy(&request.kernel, &kernel)?;
            }
        }
        std::fs::copy(&request.rootfs, paths.rootfs())?;

        if let Some(gib) = request.disk_size_gb {
            self.grow_rootfs(&paths.rootfs(), gib)?;
        }
        self.patch_rootfs(paths, request)?;

        if let Some(snapshot) = &request.snapshot {
            std::fs::create_dir_all(paths.snapshot_dir())?;
            std::fs::copy(&snapshot.snapshot_file, paths.root_dir.join(JAIL_SNAPSHOT_FILE))?;
            std::fs::copy(&snapshot.mem_file, paths.root_dir.join(JAIL_MEM_FILE))?;
        }
        Ok(())
    }

    fn spawn(&self, vm_id: &VmId, paths: &JailPaths, request: &SpawnRequest) -> Result<(), ExecutorError> {
        let args = jailer_args(vm_id, paths, request, CgroupVersion::detect(&self.cgroup_root));
        let cmd = Cmd::sudo(request.jailer_bin.display().to_string()).args(args);
        tracing::info!(vm_id = %vm_id, netns = ?request.netns, seccomp = request.seccomp_filter.is_some(), "spawning VMM");

        let out = self.runner.output(&cmd)?;
        if out.success() {
            return Ok(());
        }
        if is_stale_device_failure(&out.stderr) {
            return Err(ExecutorError::StaleDeviceNode { vm_id: vm_id.clone(), detail: out.stderr.trim().to_owned() });
        }
        Err(ExecutorError::SpawnFailed(out.into_error(&cmd).to_string()))
    }

    fn clear_stale(&self, paths: &JailPaths) -> Result<(), ExecutorError> {
        let files = [paths.socket(), paths.pid_file()];
        for file in files.iter().filter(|f| f.exists()) {
            self.sudo("rm", ["-f".to_owned(), file.display().to_string()])?;
        }
        if paths.dev_dir().exists() {
            self.sudo("rm", ["-rf".to_owned(), paths.dev_dir().display().to_string()])?;
        }
        Ok(())
    }

    fn force_clear_devices(&self, paths: &JailPaths) -> Result<(), ExecutorError> {
        let dev = paths.dev_dir().display().to_string();
        // A lingering bind mount keeps the nodes alive through rm.
        if let Err(e) = self.sudo("umount", ["-l", "-R", dev.as_str()]) {
            tracing::debug!(dev = %dev, error = %e, "no mounts under device tree");
        }
        let run = paths.root_dir.join("run").display().to_string();
        self.sudo("rm", ["-rf", dev.as_str(), run.as_str()])?;
        std::fs::create_dir_all(paths.root_dir.join("run"))?;
        Ok(())
    }

    fn remove(&self, paths: &JailPaths) {
        self.remove_path(&paths.root_dir);
        self.remove_path(&paths.jail_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    fn id() -> VmId {
        match VmId::new("vm-00c0ffee") {
            Ok(id) => id,
            Err(e) => panic!("id: {e}"),
        }
    }

    fn spawn_request() -> SpawnRequest {
        SpawnRequest {
            firecracker_bin: PathBuf::from("/opt/husk/bin/firecracker"),
            jailer_bin: PathBuf::from("/opt/husk/bin/jailer"),
            uid: 0,
            gid: 0,
            seccomp_filter: None,
            new_pid_ns: true,
            cgroup: Some(CgroupLimits::for_vm(2, 256)),
            netns: Some("husk-vm-00c0ffee".to_owned()),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: JailPaths,
        runner: Arc<RecordingRunner>,
        jailer: Jailer,
        request: PrepareRequest,
    }

    fn fixture() -> Fixture {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let kernel = dir.path().join("vmlinux-6.1");
        let rootfs = dir.path().join("base.ext4");
        if let Err(e) = std::fs::write(&kernel, b"kernel").and_then(|()| std::fs::write(&rootfs, vec![0u8; 4096])) {
            panic!("fixture: {e}");
        }
        let paths = JailPaths::new(&dir.path().join("jailer"), &id());
        let runner = Arc::new(RecordingRunner::default());
        let jailer = Jailer::new(runner.clone());
        let request = PrepareRequest {
            vm_id: id(),
            kernel,
            rootfs,
            disk_size_gb: None,
            snapshot: None,
            welcome_ports: None,
            agent: None,
        };
        Fixture { _dir: dir, paths, runner, jailer, request }
    }

    #[test]
    fn layout_matches_jailer_conventions() {
        let paths = JailPaths::new(Path::new("/var/lib/husk/jailer"), &id());
        assert_eq!(paths.root_dir, PathBuf::from("/var/lib/husk/jailer/firecracker/vm-00c0ffee/root"));
        assert_eq!(paths.socket(), paths.root_dir.join("run/firecracker.socket"));
        assert_eq!(JailPaths::from_root(&paths.root_dir), Some(paths));
    }

    #[test]
    fn cgroup_limits_include_vmm_overhead() {
        let limits = CgroupLimits::for_vm(2, 256);
        assert_eq!(limits.cpu_quota_us, 200_000);
        assert_eq!(limits.cpu_period_us, 100_000);
        assert_eq!(limits.memory_bytes, 320 * 1024 * 1024);
    }

    #[test]
    fn cgroup_v2_args() {
        let paths = JailPaths::new(Path::new("/j"), &id());
        let args = jailer_args(&id(), &paths, &spawn_request(), CgroupVersion::V2);
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "--exec-file /opt/husk/bin/firecracker --id vm-00c0ffee --uid 0 --gid 0 --chroot-base-dir /j --daemonize --new-pid-ns"
        ));
        assert!(joined.contains("--netns /var/run/netns/husk-vm-00c0ffee"));
        assert!(joined.contains("--cgroup-version 2 --cgroup cpu.max=200000 100000 --cgroup memory.max=335544320"));
        assert!(joined.ends_with("-- --api-sock run/firecracker.socket --no-seccomp"));
    }

    #[test]
    fn cgroup_v1_args_and_optional_layers_off() {
        let paths = JailPaths::new(Path::new("/j"), &id());
        let request = SpawnRequest { new_pid_ns: false, netns: None, ..spawn_request() };
        let args = jailer_args(&id(), &paths, &request, CgroupVersion::V1);
        assert!(!args.contains(&"--new-pid-ns".to_owned()));
        assert!(!args.contains(&"--netns".to_owned()));
        assert!(!args.contains(&"--cgroup-version".to_owned()));
        assert!(args.contains(&"cpu.cfs_quota_us=200000".to_owned()));
        assert!(args.contains(&"memory.limit_in_bytes=335544320".to_owned()));
    }

    #[test]
    fn missing_seccomp_filter_runs_unfiltered() {
        let paths = JailPaths::new(Path::new("/j"), &id());
        let request = SpawnRequest { seccomp_filter: Some(PathBuf::from("/nonexistent.bpf")), ..spawn_request() };
        let args = jailer_args(&id(), &paths, &request, CgroupVersion::V2);
        assert_eq!(args.last().map(String::as_str), Some("--no-seccomp"));
    }

    #[test]
    fn cgroup_version_detection() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        assert_eq!(CgroupVersion::detect(dir.path()), CgroupVersion::V1);
        if let Err(e) = std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory") {
            panic!("fixture: {e}");
        }
        assert_eq!(CgroupVersion::detect(dir.path()), CgroupVersion::V2);
    }

    #[test]
    fn prepare_populates_jail_and_always_unmounts() {
        let f = fixture();
        if let Err(e) = f.jailer.prepare(&f.paths, &f.request) {
            panic!("prepare: {e}");
        }
        assert!(f.paths.kernel().exists());
        assert!(f.paths.rootfs().exists());
        assert!(f.paths.root_dir.join("run").is_dir());
        assert!(!f.paths.mount_point().exists(), "mount point must be cleaned up");

        let log = f.runner.commands();
        let mount = log.iter().position(|c| c.starts_with("sudo mount -o loop"));
        let umount = log.iter().position(|c| c.starts_with("sudo umount"));
        assert!(matches!((mount, umount), (Some(m), Some(u)) if m < u), "{log:#?}");
        assert!(log.iter().any(|c| c.starts_with("sudo ln -s /proc/net/pnp ")));
        assert!(!log.iter().any(|c| c.contains("e2fsck")), "no resize without a disk size");
    }

    #[test]
    fn injection_failure_still_unmounts() {
        let f = fixture();
        f.runner.fail("sudo ln -s /proc/net/pnp", "read-only file system");
        let result = f.jailer.prepare(&f.paths, &f.request);
        assert!(matches!(result, Err(ExecutorError::CommandFailed { .. })), "got {result:?}");
        assert!(f.runner.commands().iter().any(|c| c.starts_with("sudo umount")));
    }

    #[test]
    fn disk_growth_runs_check_before_resize() {
        let mut f = fixture();
        f.request.disk_size_gb = Some(1);
        f.runner.exit_with("sudo e2fsck", 1, "");
        if let Err(e) = f.jailer.prepare(&f.paths, &f.request) {
            panic!("prepare: {e}");
        }
        let len = match std::fs::metadata(f.paths.rootfs()) {
            Ok(m) => m.len(),
            Err(e) => panic!("metadata: {e}"),
        };
        assert_eq!(len, GIB);

        let log = f.runner.commands();
        let step = |prefix: &str| log.iter().position(|c| c.starts_with(prefix));
        let (fsck, resize, tune) = (step("sudo e2fsck -fy"), step("sudo resize2fs"), step("sudo tune2fs -m 0"));
        assert!(matches!((fsck, resize, tune), (Some(a), Some(b), Some(c)) if a < b && b < c), "{log:#?}");
    }

    #[test]
    fn uncorrectable_fsck_aborts_growth() {
        let mut f = fixture();
        f.request.disk_size_gb = Some(1);
        f.runner.exit_with("sudo e2fsck", 4, "errors left uncorrected");
        assert!(f.jailer.prepare(&f.paths, &f.request).is_err());
        assert!(!f.runner.commands().iter().any(|c| c.starts_with("sudo resize2fs")));
    }

    #[test]
    fn agent_and_welcome_units_are_enabled() {
        let mut f = fixture();
        f.request.welcome_ports = Some(vec![3000]);
        f.request.agent = Some(AgentInjection {
            binary: PathBuf::from("/opt/husk/bin/husk-agent"),
            token: "secret".to_owned(),
            port: 9119,
        });
        if let Err(e) = f.jailer.prepare(&f.paths, &f.request) {
            panic!("prepare: {e}");
        }
        let log = f.runner.commands();
        for unit in [guest::AGENT_UNIT, guest::WELCOME_UNIT] {
            assert!(
                log.iter().any(|c| c.starts_with("sudo ln -sf /etc/systemd/system/") && c.ends_with(unit)),
                "{unit} not enabled: {log:#?}"
            );
        }
        assert!(log.iter().any(|c| c.contains("-m 0600") && c.ends_with("etc/husk/agent.env")));
    }

    #[test]
    fn stale_device_failure_is_typed() {
        let f = fixture();
        f.runner.fail("sudo /opt/husk/bin/jailer", "Failed to create /dev/kvm: File exists (os error 17)");
        match f.jailer.spawn(&id(), &f.paths, &spawn_request()) {
            Err(ExecutorError::StaleDeviceNode { vm_id, .. }) => assert_eq!(vm_id, id()),
            other => panic!("expected stale device error, got {other:?}"),
        }

        let f = fixture();
        f.runner.fail("sudo /opt/husk/bin/jailer", "No such file or directory");
        assert!(matches!(
            f.jailer.spawn(&id(), &f.paths, &spawn_request()),
            Err(ExecutorError::SpawnFailed(_))
        ));
    }

    #[test]
    fn remove_deletes_chroot_and_jail_dir() {
        let f = fixture();
        if let Err(e) = f.jailer.prepare(&f.paths, &f.request) {
            panic!("prepare: {e}");
        }
        f.jailer.remove(&f.paths);
        assert!(!f.paths.jail_dir.exists());
        assert!(f.paths.chroot_base.join("firecracker").exists(), "sibling jails must survive");
    }
}
