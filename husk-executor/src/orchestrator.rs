//! VM lifecycle orchestration.
//!
//! Composes the state store, network engine, jail provisioner and VMM
//! control client into `create`, `start`, `stop`, `remove` and policy
//! updates. Host mutation is synchronous and runs on the blocking pool;
//! only the socket, boot and agent waits are awaited directly.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use husk_core::validation::{check_port_conflicts, DEFAULT_MEMORY_MIB, DEFAULT_VCPUS};
use husk_core::{CoreError, NetworkIdentity, NetworkPolicy, PolicyRules, SnapshotId, VmId, VmRecord, VmStatus, VmUpdate};
use serde::Serialize;

use crate::agent::{self, generate_token};
use crate::backend::{BootConfig, RestoreConfig, VmmBackend};
use crate::command::{CommandRunner, SystemRunner};
use crate::config::{HuskPaths, IsolationOptions, Timeouts};
use crate::environment::Environment;
use crate::firecracker::FirecrackerBackend;
use crate::hooks::{HookRegistry, LifecycleEvent, Phase};
use crate::jail::{
    AgentInjection, CgroupLimits, JailBackend, JailPaths, Jailer, PrepareRequest, SpawnRequest, JAIL_KERNEL,
    JAIL_MEM_FILE, JAIL_ROOTFS, JAIL_SNAPSHOT_FILE,
};
use crate::lock::FileLock;
use crate::network::{netns_name, NetworkBackend, NetworkEngine, SystemNetwork};
use crate::pidfile::PidFile;
use crate::process::{ProcScanner, ProcessTable, JAILER_MARKER, VMM_MARKER};
use crate::seccomp::{SeccompArch, SeccompProvisioner};
use crate::store::{FileVmStateStore, VmStateStore};
use crate::ExecutorError;

/// Runtime whose image serves the welcome page on its published ports.
pub const DEMO_RUNTIME: &str = "node22-demo";

/// Everything a caller may choose when creating a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub vcpus: u32,
    pub mem_mib: u32,
    /// Grow the root filesystem to this size; `None` keeps the image size.
    pub disk_size_gb: Option<u32>,
    /// Explicit kernel image; defaults to the newest installed one.
    pub kernel: Option<PathBuf>,
    /// Explicit root filesystem image; defaults to the newest installed one.
    pub rootfs: Option<PathBuf>,
    pub project: String,
    pub runtime: String,
    pub rules: PolicyRules,
    pub published_ports: Vec<u16>,
    pub bandwidth_mbit: Option<u32>,
    pub isolation: IsolationOptions,
    /// Stop the VM once it has run this long.
    pub timeout: Option<Duration>,
    pub snapshot: Option<SnapshotId>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            vcpus: DEFAULT_VCPUS,
            mem_mib: DEFAULT_MEMORY_MIB,
            disk_size_gb: None,
            kernel: None,
            rootfs: None,
            project: String::new(),
            runtime: "base".to_owned(),
            rules: PolicyRules::allow_all(),
            published_ports: Vec::new(),
            bandwidth_mbit: None,
            isolation: IsolationOptions::default(),
            timeout: None,
            snapshot: None,
        }
    }
}

/// How a successful stop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Declared policy before and after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
    pub previous_policy: NetworkPolicy,
    pub new_policy: NetworkPolicy,
}

/// Result of one VM within a batch operation.
#[derive(Debug)]
pub struct VmOutcome<T> {
    pub vm_id: VmId,
    pub result: Result<T, ExecutorError>,
}

/// Top-level coordinator for VM lifecycle operations.
///
/// Cheap to clone; clones share every backend.
#[derive(Clone)]
pub struct Orchestrator {
    paths: HuskPaths,
    timeouts: Timeouts,
    /// Isolation applied when restarting a stopped VM.
    isolation: IsolationOptions,
    owner: (u32, u32),
    store: Arc<dyn VmStateStore>,
    network: Arc<dyn NetworkBackend>,
    jail: Arc<dyn JailBackend>,
    vmm: Arc<dyn VmmBackend>,
    procs: Arc<dyn ProcessTable>,
    seccomp: Option<SeccompProvisioner>,
    hooks: HookRegistry,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("base", &self.paths.base())
            .field("timeouts", &self.timeouts)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        paths: HuskPaths,
        store: Arc<dyn VmStateStore>,
        network: Arc<dyn NetworkBackend>,
        jail: Arc<dyn JailBackend>,
        vmm: Arc<dyn VmmBackend>,
        procs: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            paths,
            timeouts: Timeouts::default(),
            isolation: IsolationOptions::default(),
            owner: (0, 0),
            store,
            network,
            jail,
            vmm,
            procs,
            seccomp: None,
            hooks: HookRegistry::new(),
        }
    }

    /// Orchestrator driving the real host through `sudo`, `/proc`, the
    /// jailer and Firecracker.
    #[must_use]
    pub fn system(paths: HuskPaths) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let timeouts = Timeouts::default();
        let orchestrator = Self::new(
            paths.clone(),
            Arc::new(FileVmStateStore::new(paths.vms_dir())),
            Arc::new(SystemNetwork::new(runner.clone())),
            Arc::new(Jailer::new(runner.clone())),
            Arc::new(FirecrackerBackend::new(timeouts.socket_poll)),
            Arc::new(ProcScanner::new(runner.clone())),
        );
        match SeccompArch::host() {
            Some(arch) => orchestrator.with_seccomp(SeccompProvisioner::new(&paths, arch, runner)),
            None => {
                tracing::warn!(arch = std::env::consts::ARCH, "no seccomp support for this architecture");
                orchestrator
            }
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationOptions) -> Self {
        self.isolation = isolation;
        self
    }

    /// User and group the VMM runs as inside its jail.
    #[must_use]
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = (uid, gid);
        self
    }

    #[must_use]
    pub fn with_seccomp(mut self, seccomp: SeccompProvisioner) -> Self {
        self.seccomp = Some(seccomp);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &HuskPaths {
        &self.paths
    }

    /// Runs synchronous host work on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, ExecutorError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| ExecutorError::Io(std::io::Error::other(e)))?
    }

    fn load(&self, id: &VmId) -> Result<VmRecord, ExecutorError> {
        self.store.load(id)?.ok_or_else(|| ExecutorError::VmNotFound(id.clone()))
    }

    // ---- create ----------------------------------------------------------

    /// Creates, provisions and boots a new VM.
    ///
    /// On failure after the record exists, the record is marked
    /// [`VmStatus::Error`] and every partially created resource is
    /// released before the triggering error is returned.
    ///
    /// # Errors
    /// Validation errors before anything is touched; otherwise the first
    /// failing provisioning, control-plane or timeout error.
    pub async fn create(&self, options: CreateOptions) -> Result<VmRecord, ExecutorError> {
        let rules = options.rules.clone().normalized()?;
        if options.snapshot.is_some() && options.disk_size_gb.is_some() {
            return Err(CoreError::MutuallyExclusive { first: "--snapshot", second: "--disk" }.into());
        }

        let (paths, kernel, rootfs, snapshot) =
            (self.paths.clone(), options.kernel.clone(), options.rootfs.clone(), options.snapshot.clone());
        let env = self
            .blocking(move |_| Environment::resolve(&paths, kernel.as_deref(), rootfs.as_deref(), snapshot.as_ref()))
            .await?;

        let vm_id = VmId::generate();
        self.hooks.emit(&LifecycleEvent::BeforeCreate { vm_id: vm_id.clone() });
        let record = self.claim_slot(vm_id, &options, rules, &env).await?;
        let jail = JailPaths::new(&self.paths.jailer_dir(), &record.id);
        tracing::info!(vm_id = %record.id, slot = %record.network.host_ip, vcpus = record.vcpu_count, mem_mib = record.mem_size_mib, "creating VM");

        match self.provision(&record, &jail, &env, options.isolation).await {
            Ok(running) => {
                self.hooks.emit(&LifecycleEvent::StateChange {
                    vm_id: running.id.clone(),
                    from: VmStatus::Creating,
                    to: VmStatus::Running,
                });
                self.hooks.emit(&LifecycleEvent::AfterCreate { record: running.clone() });
                tracing::info!(vm_id = %running.id, pid = ?running.pid, guest_ip = %running.network.guest_ip, "VM running");
                Ok(running)
            }
            Err(e) => {
                self.fail(&record, Some(jail), Phase::Create, &e).await;
                Err(e)
            }
        }
    }

    /// Allocates a slot and persists the `Creating` record, atomically
    /// with respect to other creates on this host.
    async fn claim_slot(
        &self,
        vm_id: VmId,
        options: &CreateOptions,
        rules: PolicyRules,
        env: &Environment,
    ) -> Result<VmRecord, ExecutorError> {
        let lock = FileLock::new(self.paths.slot_lock(), self.timeouts.lock_retries, self.timeouts.lock_retry_interval);
        let _guard = lock.acquire().await?;

        let options = options.clone();
        let (kernel, rootfs) = (env.kernel.clone(), env.rootfs.clone());
        self.blocking(move |this| {
            check_port_conflicts(&options.published_ports, &this.store.list()?)?;
            let slot = this.store.allocate_slot(&this.network.interfaces()?)?;

            let jail = JailPaths::new(&this.paths.jailer_dir(), &vm_id);
            let netns = options.isolation.netns.then(|| netns_name(&vm_id));
            let network = NetworkIdentity::new(slot, rules, options.published_ports, options.bandwidth_mbit, netns);
            let agent_token = this.paths.agent_bin().exists().then(generate_token).transpose()?;
            let created_at = Utc::now();

            let record = VmRecord {
                project: options.project,
                runtime: options.runtime,
                disk_size_gb: options.disk_size_gb,
                status: VmStatus::Creating,
                pid: None,
                api_socket: jail.socket(),
                chroot_dir: jail.root_dir,
                kernel,
                rootfs,
                vcpu_count: options.vcpus,
                mem_size_mib: options.mem_mib,
                network,
                snapshot: options.snapshot,
                timeout_ms: options.timeout.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                timeout_at: options
                    .timeout
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .and_then(|d| created_at.checked_add_signed(d)),
                created_at,
                error: None,
                agent_token,
                agent_port: this.paths.agent_port,
                id: vm_id,
            };
            this.store.save(&record)?;
            tracing::debug!(vm_id = %record.id, slot = %slot, "slot claimed");
            Ok(record)
        })
        .await
    }

    async fn provision(
        &self,
        record: &VmRecord,
        jail: &JailPaths,
        env: &Environment,
        isolation: IsolationOptions,
    ) -> Result<VmRecord, ExecutorError> {
        let prepare = PrepareRequest {
            vm_id: record.id.clone(),
            kernel: env.kernel.clone(),
            rootfs: env.rootfs.clone(),
            disk_size_gb: record.disk_size_gb,
            snapshot: env.snapshot.clone(),
            welcome_ports: (record.runtime == DEMO_RUNTIME).then(|| record.network.published_ports.clone()),
            agent: self.agent_injection(record),
        };

        let (rec, paths) = (record.clone(), jail.clone());
        let spawn = self
            .blocking(move |this| {
                this.setup_network(&rec)?;
                this.jail.prepare(&paths, &prepare)?;
                Ok(this.spawn_request(&rec, isolation))
            })
            .await?;
        self.launch(record, jail, spawn, self.timeouts.socket).await?;

        if env.snapshot.is_some() {
            let restore = RestoreConfig {
                snapshot_path: JAIL_SNAPSHOT_FILE.to_owned(),
                mem_path: JAIL_MEM_FILE.to_owned(),
            };
            self.vmm.restore(&jail.socket(), &restore).await?;
        } else {
            self.vmm.boot(&jail.socket(), &boot_config(record)?).await?;
        }
        self.mark_running(record.id.clone(), jail.clone()).await
    }

    fn agent_injection(&self, record: &VmRecord) -> Option<AgentInjection> {
        let token = record.agent_token.clone()?;
        let binary = self.paths.agent_bin();
        binary.exists().then(|| AgentInjection { binary, token, port: record.agent_port })
    }

    fn spawn_request(&self, record: &VmRecord, isolation: IsolationOptions) -> SpawnRequest {
        let seccomp_filter = if isolation.seccomp {
            let filter = self.seccomp.as_ref().and_then(SeccompProvisioner::ensure);
            if filter.is_none() {
                tracing::warn!(vm_id = %record.id, "no seccomp filter available; VMM runs unfiltered");
            }
            filter
        } else {
            None
        };
        SpawnRequest {
            firecracker_bin: self.paths.firecracker_bin(),
            jailer_bin: self.paths.jailer_bin(),
            uid: self.owner.0,
            gid: self.owner.1,
            seccomp_filter,
            new_pid_ns: isolation.pid_ns,
            cgroup: isolation.cgroup.then(|| CgroupLimits::for_vm(record.vcpu_count, record.mem_size_mib)),
            netns: record.network.netns_name.clone(),
        }
    }

    /// Persists the uplink before touching the host so that any later
    /// teardown, including one after a partial setup, removes NAT rules
    /// against the interface they were bound to.
    fn setup_network(&self, record: &VmRecord) -> Result<(), ExecutorError> {
        let mut engine = NetworkEngine::new(record.network.clone(), self.network.clone())?;
        engine.resolve_uplink()?;
        self.store.update(&record.id, VmUpdate::default().network(engine.identity().clone()))?;
        engine.setup()?;
        self.hooks.emit(&LifecycleEvent::NetworkSetup {
            vm_id: record.id.clone(),
            slot: record.network.slot()?,
            policy: record.network.rules().effective(),
        });
        Ok(())
    }

    /// Spawns the VMM and waits for its control socket.
    async fn launch(
        &self,
        record: &VmRecord,
        jail: &JailPaths,
        spawn: SpawnRequest,
        timeout: Duration,
    ) -> Result<(), ExecutorError> {
        let (id, paths) = (record.id.clone(), jail.clone());
        self.blocking(move |this| this.jail.spawn(&id, &paths, &spawn)).await?;
        self.vmm.wait_for_socket(&jail.socket(), timeout).await
    }

    async fn mark_running(&self, id: VmId, jail: JailPaths) -> Result<VmRecord, ExecutorError> {
        self.blocking(move |this| {
            let pid = this.discover_pid(&id, &jail);
            if pid.is_none() {
                tracing::warn!(vm_id = %id, "VMM process not found; pid left unset");
            }
            this.store.update(&id, VmUpdate::default().status(VmStatus::Running).pid(pid).error(None))
        })
        .await
    }

    /// Pid from the jailer's pid file, else from a process-table scan.
    fn discover_pid(&self, id: &VmId, jail: &JailPaths) -> Option<u32> {
        match PidFile::new(jail.pid_file()).read(&*self.procs) {
            Ok(Some(pid)) => Some(pid),
            Ok(None) => self.procs.find(VMM_MARKER, id),
            Err(e) => {
                tracing::debug!(vm_id = %id, error = %e, "pid file unreadable; scanning process table");
                self.procs.find(VMM_MARKER, id)
            }
        }
    }

    // ---- cleanup ---------------------------------------------------------

    /// Kills the tracked pid and any VMM or jailer process naming `id`.
    fn kill_vm_processes(&self, id: &VmId, tracked: Option<u32>) {
        let found = [VMM_MARKER, JAILER_MARKER].map(|marker| self.procs.find(marker, id));
        for pid in std::iter::once(tracked).chain(found).flatten() {
            match self.procs.kill(pid) {
                Ok(true) => tracing::debug!(vm_id = %id, pid, "killed VM process"),
                Ok(false) => {}
                Err(e) => tracing::warn!(vm_id = %id, pid, error = %e, "could not kill VM process"),
            }
        }
    }

    fn teardown_network(&self, record: &VmRecord) {
        match NetworkEngine::new(record.network.clone(), self.network.clone()) {
            Ok(engine) => {
                engine.teardown();
                if let Ok(slot) = record.network.slot() {
                    self.hooks.emit(&LifecycleEvent::NetworkTeardown { vm_id: record.id.clone(), slot });
                }
            }
            Err(e) => tracing::warn!(vm_id = %record.id, error = %e, "record has no usable network identity"),
        }
    }

    /// Compensating cleanup after a failed create or start. Never fails;
    /// `error` is what the caller will see.
    async fn fail(&self, record: &VmRecord, jail: Option<JailPaths>, phase: Phase, error: &ExecutorError) {
        tracing::warn!(vm_id = %record.id, %phase, error = %error, "operation failed; cleaning up");
        let (rec, message) = (record.clone(), error.to_string());
        let cleaned = self
            .blocking(move |this| {
                this.kill_vm_processes(&rec.id, None);
                let current = match this.store.update(&rec.id, VmUpdate::failed(message).pid(None)) {
                    Ok(current) => current,
                    Err(e) => {
                        tracing::warn!(vm_id = %rec.id, error = %e, "could not mark VM as failed");
                        rec
                    }
                };
                this.teardown_network(&current);
                if let Some(jail) = &jail {
                    this.jail.remove(jail);
                }
                Ok(())
            })
            .await;
        if let Err(e) = cleaned {
            tracing::warn!(vm_id = %record.id, error = %e, "cleanup did not run");
        }
        self.hooks.emit(&LifecycleEvent::Error { vm_id: record.id.clone(), phase, message: error.to_string() });
        self.hooks.emit(&LifecycleEvent::StateChange {
            vm_id: record.id.clone(),
            from: record.status,
            to: VmStatus::Error,
        });
    }

    // ---- start -----------------------------------------------------------

    /// Boots a stopped VM again from its existing jail.
    ///
    /// A spawn that fails with a recoverable signature (socket timeout,
    /// leftover device node) is retried once, with a longer socket wait,
    /// after force-clearing the jail's device tree.
    ///
    /// # Errors
    /// [`ExecutorError::VmNotStopped`] unless stopped,
    /// [`ExecutorError::ChrootNotFound`] if the jail is gone (nothing is
    /// spawned), otherwise the failure that survived the retry.
    pub async fn start(&self, id: &VmId) -> Result<VmRecord, ExecutorError> {
        let vm_id = id.clone();
        let (record, jail) = self
            .blocking(move |this| {
                let record = this.load(&vm_id)?;
                if record.status != VmStatus::Stopped {
                    return Err(ExecutorError::VmNotStopped { vm_id, status: record.status });
                }
                let jail = JailPaths::from_root(&record.chroot_dir)
                    .filter(|j| j.root_dir.is_dir())
                    .ok_or_else(|| ExecutorError::ChrootNotFound { vm_id, path: record.chroot_dir.clone() })?;
                Ok((record, jail))
            })
            .await?;

        self.hooks.emit(&LifecycleEvent::BeforeStart { vm_id: record.id.clone() });
        tracing::info!(vm_id = %record.id, "starting VM");
        match self.relaunch(&record, &jail).await {
            Ok(running) => {
                self.hooks.emit(&LifecycleEvent::StateChange {
                    vm_id: running.id.clone(),
                    from: VmStatus::Stopped,
                    to: VmStatus::Running,
                });
                self.hooks.emit(&LifecycleEvent::AfterStart { record: running.clone() });
                tracing::info!(vm_id = %running.id, pid = ?running.pid, "VM running");
                Ok(running)
            }
            Err(e) => {
                self.fail(&record, None, Phase::Start, &e).await;
                Err(e)
            }
        }
    }

    async fn relaunch(&self, record: &VmRecord, jail: &JailPaths) -> Result<VmRecord, ExecutorError> {
        let (rec, paths, isolation) = (record.clone(), jail.clone(), self.isolation);
        let spawn = self
            .blocking(move |this| {
                this.setup_network(&rec)?;
                // The jailer refuses to run over a previous run's artifacts.
                this.jail.clear_stale(&paths)?;
                Ok(this.spawn_request(&rec, isolation))
            })
            .await?;

        if let Err(e) = self.launch(record, jail, spawn.clone(), self.timeouts.socket).await {
            if !e.is_recoverable_spawn_failure() {
                return Err(e);
            }
            tracing::warn!(vm_id = %record.id, error = %e, "VMM did not come up; clearing devices and retrying once");
            let (id, paths) = (record.id.clone(), jail.clone());
            self.blocking(move |this| {
                this.kill_vm_processes(&id, None);
                this.jail.force_clear_devices(&paths)?;
                this.jail.clear_stale(&paths)
            })
            .await?;
            self.launch(record, jail, spawn, self.timeouts.socket_retry).await?;
        }

        self.vmm.boot(&jail.socket(), &boot_config(record)?).await?;
        self.mark_running(record.id.clone(), jail.clone()).await
    }

    // ---- stop / remove ---------------------------------------------------

    /// Kills the VM's processes, tears down its network and marks it
    /// stopped. Stopping a stopped VM is a no-op.
    ///
    /// # Errors
    /// [`ExecutorError::VmNotFound`], or a store failure while recording
    /// the new status. Kill and teardown failures are logged only.
    pub async fn stop(&self, id: &VmId) -> Result<StopOutcome, ExecutorError> {
        let vm_id = id.clone();
        let record = self.blocking(move |this| this.load(&vm_id)).await?;
        if record.status == VmStatus::Stopped {
            tracing::info!(vm_id = %id, "VM already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.hooks.emit(&LifecycleEvent::BeforeStop { vm_id: id.clone(), status: record.status });
        let rec = record.clone();
        self.blocking(move |this| {
            this.kill_vm_processes(&rec.id, rec.pid);
            this.teardown_network(&rec);
            this.store.update(&rec.id, VmUpdate::default().status(VmStatus::Stopped).pid(None))
        })
        .await?;

        self.hooks.emit(&LifecycleEvent::StateChange { vm_id: id.clone(), from: record.status, to: VmStatus::Stopped });
        self.hooks.emit(&LifecycleEvent::AfterStop { vm_id: id.clone(), previous: record.status });
        tracing::info!(vm_id = %id, previous = %record.status, "VM stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Deletes the VM's jail and then its record.
    ///
    /// # Errors
    /// [`ExecutorError::VmNotStopped`] for a VM that is not stopped unless
    /// `force` is set, in which case it is stopped first.
    pub async fn remove(&self, id: &VmId, force: bool) -> Result<(), ExecutorError> {
        let vm_id = id.clone();
        let record = self.blocking(move |this| this.load(&vm_id)).await?;
        if record.status != VmStatus::Stopped {
            if !force {
                return Err(ExecutorError::VmNotStopped { vm_id: id.clone(), status: record.status });
            }
            self.stop(id).await?;
        }

        self.hooks.emit(&LifecycleEvent::BeforeRemove { vm_id: id.clone(), force });
        let rec = record.clone();
        self.blocking(move |this| {
            match JailPaths::from_root(&rec.chroot_dir) {
                Some(jail) => this.jail.remove(&jail),
                None => tracing::warn!(vm_id = %rec.id, chroot = %rec.chroot_dir.display(), "unrecognised chroot layout; left in place"),
            }
            // Last, so an interrupted removal can be retried.
            this.store.delete(&rec.id)
        })
        .await?;

        self.hooks.emit(&LifecycleEvent::AfterRemove { vm_id: id.clone() });
        tracing::info!(vm_id = %id, "VM removed");
        Ok(())
    }

    /// Stops each VM in turn.
    pub async fn stop_many(&self, ids: &[VmId]) -> Vec<VmOutcome<StopOutcome>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(VmOutcome { vm_id: id.clone(), result: self.stop(id).await });
        }
        outcomes
    }

    /// Removes each VM in turn.
    pub async fn remove_many(&self, ids: &[VmId], force: bool) -> Vec<VmOutcome<()>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(VmOutcome { vm_id: id.clone(), result: self.remove(id, force).await });
        }
        outcomes
    }

    /// Stops every running VM whose timeout has passed.
    ///
    /// # Errors
    /// Fails only if the store cannot be listed.
    pub async fn reap_expired(&self) -> Result<Vec<VmOutcome<StopOutcome>>, ExecutorError> {
        let now = Utc::now();
        let expired: Vec<VmId> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "stopping expired VMs");
        }
        Ok(self.stop_many(&expired).await)
    }

    // ---- network policy --------------------------------------------------

    /// Replaces the filter policy of a running VM.
    ///
    /// Serialised per VM by a file lock; different VMs update in parallel.
    ///
    /// # Errors
    /// Validation errors, [`ExecutorError::VmNotRunning`], a lock timeout,
    /// or the engine's apply or rollback failure.
    pub async fn update_network_policy(&self, id: &VmId, rules: PolicyRules) -> Result<PolicyUpdate, ExecutorError> {
        let rules = rules.normalized()?;
        let lock = FileLock::new(self.paths.policy_lock(id), self.timeouts.lock_retries, self.timeouts.lock_retry_interval);
        let _guard = lock.acquire().await?;

        let vm_id = id.clone();
        let result = self
            .blocking(move |this| {
                let record = this.load(&vm_id)?;
                if record.status != VmStatus::Running {
                    return Err(ExecutorError::VmNotRunning { vm_id, status: record.status });
                }
                let update = PolicyUpdate { previous_policy: record.network.network_policy, new_policy: rules.policy };
                let mut engine = NetworkEngine::new(record.network, this.network.clone())?;
                engine.update_policy(&vm_id, rules)?;
                this.store.update(&vm_id, VmUpdate::default().network(engine.into_identity()))?;
                Ok(update)
            })
            .await;

        match &result {
            Ok(update) => self.hooks.emit(&LifecycleEvent::PolicyChange {
                vm_id: id.clone(),
                previous: update.previous_policy,
                new: update.new_policy,
            }),
            Err(e) if !e.is_not_found() => self.hooks.emit(&LifecycleEvent::Error {
                vm_id: id.clone(),
                phase: Phase::NetworkPolicy,
                message: e.to_string(),
            }),
            Err(_) => {}
        }
        result
    }

    // ---- queries ---------------------------------------------------------

    /// Every VM, newest first.
    ///
    /// # Errors
    /// Fails if the store cannot be listed.
    pub async fn list(&self) -> Result<Vec<VmRecord>, ExecutorError> {
        let mut records = self.blocking(|this| this.store.list()).await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// # Errors
    /// [`ExecutorError::VmNotFound`] if no such VM exists.
    pub async fn get(&self, id: &VmId) -> Result<VmRecord, ExecutorError> {
        let vm_id = id.clone();
        self.blocking(move |this| this.load(&vm_id)).await
    }

    /// Waits for the VM's in-guest agent to report healthy.
    ///
    /// # Errors
    /// [`ExecutorError::VmNotRunning`], or an agent timeout.
    pub async fn wait_for_agent(&self, id: &VmId) -> Result<(), ExecutorError> {
        let record = self.get(id).await?;
        if record.status != VmStatus::Running {
            return Err(ExecutorError::VmNotRunning { vm_id: id.clone(), status: record.status });
        }
        agent::wait_for_agent(record.network.guest_ip, record.agent_port, self.timeouts.agent, self.timeouts.agent_poll)
            .await
    }
}

fn boot_config(record: &VmRecord) -> Result<BootConfig, ExecutorError> {
    Ok(BootConfig {
        kernel_path: JAIL_KERNEL.to_owned(),
        boot_args: record.network.slot()?.boot_args(),
        rootfs_path: JAIL_ROOTFS.to_owned(),
        vcpu_count: record.vcpu_count,
        mem_size_mib: record.mem_size_mib,
        tap_device: record.network.tap_device.clone(),
        mac_address: record.network.mac_address.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use husk_core::{ErrorKind, Slot};
    use proptest::prelude::*;

    use super::*;
    use crate::hooks::HookError;
    use crate::network::NetScope;
    use crate::testing::{FakeJail, FakeNetwork, FakeProcesses, FakeVmm, SpawnFault};

    struct Harness {
        _dir: tempfile::TempDir,
        paths: HuskPaths,
        store: Arc<FileVmStateStore>,
        net: Arc<FakeNetwork>,
        procs: Arc<FakeProcesses>,
        jail: Arc<FakeJail>,
        vmm: Arc<FakeVmm>,
        events: Arc<Mutex<Vec<&'static str>>>,
        orch: Orchestrator,
    }

    fn touch(path: &std::path::Path) {
        let created = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(path, b"x"));
        if let Err(e) = created {
            panic!("fixture {}: {e}", path.display());
        }
    }

    fn harness() -> Harness {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let paths = HuskPaths::new(dir.path());
        for file in [
            paths.firecracker_bin(),
            paths.jailer_bin(),
            paths.kernels_dir().join("vmlinux-6.1"),
            paths.rootfs_dir().join("base.ext4"),
        ] {
            touch(&file);
        }

        let store = Arc::new(FileVmStateStore::new(paths.vms_dir()));
        let net = Arc::new(FakeNetwork::default());
        let procs = Arc::new(FakeProcesses::default());
        let jail = Arc::new(FakeJail::new(procs.clone()));
        let vmm = Arc::new(FakeVmm::default());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(move |e: &LifecycleEvent| -> Result<(), HookError> {
            sink.lock().map_err(|poisoned| poisoned.to_string())?.push(e.name());
            Ok(())
        }));

        let timeouts = Timeouts {
            lock_retries: 20_000,
            lock_retry_interval: Duration::from_millis(1),
            agent: Duration::from_millis(50),
            agent_poll: Duration::from_millis(10),
            ..Timeouts::default()
        };
        let orch = Orchestrator::new(paths.clone(), store.clone(), net.clone(), jail.clone(), vmm.clone(), procs.clone())
            .with_timeouts(timeouts)
            .with_hooks(hooks);
        Harness { _dir: dir, paths, store, net, procs, jail, vmm, events, orch }
    }

    impl Harness {
        fn record(&self, id: &VmId) -> Option<VmRecord> {
            match self.store.load(id) {
                Ok(r) => r,
                Err(e) => panic!("load: {e}"),
            }
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    fn must<T>(r: Result<T, ExecutorError>) -> T {
        match r {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn create_stop_remove_end_to_end() {
        let h = harness();
        let created = must(h.orch.create(CreateOptions::default()).await);

        let slot = must(created.network.slot().map_err(ExecutorError::from));
        assert_eq!(created.status, VmStatus::Running);
        assert!(created.pid.is_some());
        assert_eq!(created.network.guest_ip.to_string(), format!("172.16.{slot}.2"));
        assert_eq!(h.record(&created.id), Some(created.clone()), "returned record must be the persisted one");
        assert_eq!(h.vmm.boots().len(), 1);
        assert!(h.net.namespaces().contains(&netns_name(&created.id)));
        assert_eq!(h.events(), ["vm:beforeCreate", "network:afterSetup", "state:change", "vm:afterCreate"]);

        assert_eq!(must(h.orch.stop(&created.id).await), StopOutcome::Stopped);
        let stopped = h.record(&created.id);
        assert!(matches!(stopped, Some(VmRecord { status: VmStatus::Stopped, pid: None, .. })), "got {stopped:?}");
        assert!(h.net.namespaces().is_empty());
        assert!(!h.net.links(&NetScope::Host).contains(&slot.veth_host()));
        assert_eq!(h.procs.running(), 0);

        must(h.orch.remove(&created.id, false).await);
        assert_eq!(h.record(&created.id), None);
        assert!(!created.chroot_dir.exists());
        assert!(matches!(h.orch.get(&created.id).await, Err(ExecutorError::VmNotFound(_))));
    }

    #[tokio::test]
    async fn stopping_twice_is_idempotent() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        let events_before = h.events().len();
        assert_eq!(must(h.orch.stop(&vm.id).await), StopOutcome::AlreadyStopped);
        assert_eq!(h.events().len(), events_before, "no side effects on a stopped VM");
    }

    #[tokio::test]
    async fn stop_removes_nat_after_the_default_route_moves() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        assert_eq!(vm.network.uplink.as_deref(), Some("eth0"));
        assert!(!h.net.rules(&NetScope::Host).is_empty(), "allow-all installs host NAT");

        h.net.set_uplink(Some("wlan0"));
        must(h.orch.stop(&vm.id).await);
        assert!(h.net.rules(&NetScope::Host).is_empty(), "left behind: {:?}", h.net.rules(&NetScope::Host));
    }

    #[tokio::test]
    async fn remove_without_force_leaves_running_vm_untouched() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        let before = h.record(&vm.id);

        match h.orch.remove(&vm.id, false).await {
            Err(e @ ExecutorError::VmNotStopped { .. }) => assert_eq!(e.kind(), ErrorKind::Lifecycle),
            other => panic!("expected VmNotStopped, got {other:?}"),
        }
        assert_eq!(h.record(&vm.id), before);
        assert_eq!(h.procs.running(), 1);
    }

    #[tokio::test]
    async fn forced_remove_stops_first() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.remove(&vm.id, true).await);

        assert_eq!(h.record(&vm.id), None);
        assert_eq!(h.procs.killed(), vm.pid.into_iter().collect::<Vec<_>>());
        assert!(h.net.namespaces().is_empty());
        let events = h.events();
        let at = |name| events.iter().position(|e| *e == name);
        assert!(at("vm:afterStop") < at("vm:afterRemove"), "{events:?}");
    }

    #[tokio::test]
    async fn failed_boot_marks_error_and_releases_everything() {
        let h = harness();
        h.vmm.reject_boot(400);
        let result = h.orch.create(CreateOptions::default()).await;
        assert!(matches!(result, Err(ExecutorError::ApiError { status: 400, .. })), "got {result:?}");

        let records = must(h.store.list());
        assert_eq!(records.len(), 1);
        let failed = &records[0];
        assert_eq!(failed.status, VmStatus::Error);
        assert!(failed.error.as_deref().is_some_and(|m| m.contains("400")));
        assert_eq!(h.procs.running(), 0, "spawned VMM must be killed");
        assert!(h.net.namespaces().is_empty());
        assert!(!failed.chroot_dir.exists());
        assert!(h.events().contains(&"vm:error"));
    }

    #[tokio::test]
    async fn start_without_chroot_spawns_nothing() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        if let Err(e) = std::fs::remove_dir_all(&vm.chroot_dir) {
            panic!("fixture: {e}");
        }

        let result = h.orch.start(&vm.id).await;
        assert!(matches!(result, Err(ExecutorError::ChrootNotFound { .. })), "got {result:?}");
        assert_eq!(h.jail.spawns().len(), 1, "only the create spawned");
        assert!(matches!(h.record(&vm.id), Some(VmRecord { status: VmStatus::Stopped, .. })));
    }

    #[tokio::test]
    async fn start_requires_stopped() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        assert!(matches!(h.orch.start(&vm.id).await, Err(ExecutorError::VmNotStopped { .. })));
    }

    #[tokio::test]
    async fn restart_boots_again() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);

        let restarted = must(h.orch.start(&vm.id).await);
        assert_eq!(restarted.status, VmStatus::Running);
        assert_ne!(restarted.pid, vm.pid);
        assert_eq!(restarted.network, vm.network, "network identity is reused");
        assert_eq!(h.jail.clear_count(), 1);
        assert_eq!(h.jail.force_clear_count(), 0);
        assert_eq!(h.vmm.boots().len(), 2);
    }

    #[tokio::test]
    async fn stale_device_on_start_is_retried_once() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        h.jail.fail_spawns([SpawnFault::StaleDevice]);

        let restarted = must(h.orch.start(&vm.id).await);
        assert_eq!(restarted.status, VmStatus::Running);
        assert_eq!(h.jail.spawns().len(), 3);
        assert_eq!(h.jail.force_clear_count(), 1);
        let waits = h.vmm.socket_waits();
        assert_eq!(waits.last(), Some(&Timeouts::default().socket_retry), "retry uses the longer wait");
    }

    #[tokio::test]
    async fn second_socket_timeout_is_fatal() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        h.vmm.fail_socket_waits(2);

        match h.orch.start(&vm.id).await {
            Err(e) => assert_eq!(e.code(), "ERR_TIMEOUT_SOCKET"),
            Ok(r) => panic!("start should fail, got {r:?}"),
        }
        assert_eq!(h.jail.spawns().len(), 3, "exactly one retry");
        let failed = h.record(&vm.id);
        assert!(matches!(failed, Some(VmRecord { status: VmStatus::Error, .. })), "got {failed:?}");
        assert_eq!(h.procs.running(), 0);
        assert!(vm.chroot_dir.exists(), "a failed start keeps the VM's disk");
    }

    #[tokio::test]
    async fn misconfiguration_is_not_retried() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        h.jail.fail_spawns([SpawnFault::Fatal]);

        assert!(matches!(h.orch.start(&vm.id).await, Err(ExecutorError::SpawnFailed(_))));
        assert_eq!(h.jail.spawns().len(), 2);
        assert_eq!(h.jail.force_clear_count(), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_any_record() {
        let h = harness();
        let options = CreateOptions {
            rules: PolicyRules {
                policy: NetworkPolicy::DenyAll,
                allowed_domains: vec!["example.com".to_owned()],
                ..PolicyRules::default()
            },
            ..CreateOptions::default()
        };
        let result = h.orch.create(options).await;
        assert!(matches!(result, Err(ExecutorError::Validation(CoreError::PolicyConflict))), "got {result:?}");

        let options = CreateOptions {
            snapshot: Some(must(SnapshotId::new("snap").map_err(ExecutorError::from))),
            disk_size_gb: Some(20),
            ..CreateOptions::default()
        };
        let result = h.orch.create(options).await;
        assert!(matches!(result, Err(ExecutorError::Validation(CoreError::MutuallyExclusive { .. }))));
        assert!(must(h.store.list()).is_empty());
    }

    #[tokio::test]
    async fn published_port_conflict_is_rejected() {
        let h = harness();
        let options = CreateOptions { published_ports: vec![8080], ..CreateOptions::default() };
        must(h.orch.create(options.clone()).await);
        let result = h.orch.create(options).await;
        assert!(matches!(result, Err(ExecutorError::Validation(CoreError::PortConflict { .. }))), "got {result:?}");
        assert_eq!(must(h.store.list()).len(), 1);
    }

    #[tokio::test]
    async fn snapshot_create_restores_instead_of_booting() {
        let h = harness();
        let id = must(SnapshotId::new("snap-7").map_err(ExecutorError::from));
        let dir = h.paths.snapshot_dir(&id);
        touch(&dir.join("snapshot_file"));
        touch(&dir.join("mem_file"));

        let vm = must(h.orch.create(CreateOptions { snapshot: Some(id.clone()), ..CreateOptions::default() }).await);
        assert_eq!(vm.snapshot, Some(id));
        assert!(h.vmm.boots().is_empty());
        assert_eq!(h.vmm.restores().len(), 1);
        assert!(h.jail.prepared()[0].snapshot.is_some());
    }

    #[tokio::test]
    async fn demo_runtime_and_agent_are_injected() {
        let h = harness();
        touch(&h.paths.agent_bin());
        let options = CreateOptions {
            runtime: DEMO_RUNTIME.to_owned(),
            published_ports: vec![3000],
            ..CreateOptions::default()
        };
        let vm = must(h.orch.create(options).await);

        let prepared = &h.jail.prepared()[0];
        assert_eq!(prepared.welcome_ports, Some(vec![3000]));
        let agent = prepared.agent.as_ref().map(|a| a.token.clone());
        assert!(agent.is_some());
        assert_eq!(agent, vm.agent_token);
    }

    #[tokio::test]
    async fn no_agent_binary_means_no_token() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        assert_eq!(vm.agent_token, None);
        assert_eq!(h.jail.prepared()[0].agent, None);
        assert_eq!(h.jail.prepared()[0].welcome_ports, None);
    }

    #[tokio::test]
    async fn isolation_switches_reach_the_jailer() {
        let h = harness();
        let options = CreateOptions { isolation: IsolationOptions::none(), ..CreateOptions::default() };
        let vm = must(h.orch.create(options).await);
        assert_eq!(vm.network.netns_name, None);
        let spawn = &h.jail.spawns()[0];
        assert!(!spawn.new_pid_ns);
        assert_eq!(spawn.cgroup, None);
        assert_eq!(spawn.netns, None);
        assert!(h.net.links(&NetScope::Host).contains(&vm.network.tap_device));
    }

    #[tokio::test]
    async fn policy_update_requires_running_and_persists() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);

        let update = must(h.orch.update_network_policy(&vm.id, PolicyRules::deny_all()).await);
        assert_eq!(
            update,
            PolicyUpdate { previous_policy: NetworkPolicy::AllowAll, new_policy: NetworkPolicy::DenyAll }
        );
        let stored = h.record(&vm.id).map(|r| r.network.network_policy);
        assert_eq!(stored, Some(NetworkPolicy::DenyAll));
        let ns = NetScope::Namespace(netns_name(&vm.id));
        assert_eq!(h.net.rules(&ns).len(), 2);
        assert!(h.events().contains(&"network:policyChange"));

        must(h.orch.stop(&vm.id).await);
        assert!(matches!(
            h.orch.update_network_policy(&vm.id, PolicyRules::allow_all()).await,
            Err(ExecutorError::VmNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn reaper_stops_only_expired_vms() {
        let h = harness();
        let short = CreateOptions { timeout: Some(Duration::from_millis(1)), ..CreateOptions::default() };
        let expiring = must(h.orch.create(short).await);
        let lasting = must(h.orch.create(CreateOptions::default()).await);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = must(h.orch.reap_expired().await);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].vm_id, expiring.id);
        assert!(matches!(reaped[0].result, Ok(StopOutcome::Stopped)));
        assert!(matches!(h.record(&lasting.id), Some(VmRecord { status: VmStatus::Running, .. })));
    }

    #[tokio::test]
    async fn batch_stop_reports_each_vm() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        let missing = VmId::generate();

        let outcomes = h.orch.stop_many(&[vm.id.clone(), missing.clone()]).await;
        assert!(matches!(outcomes[0].result, Ok(StopOutcome::Stopped)));
        assert!(matches!(&outcomes[1].result, Err(ExecutorError::VmNotFound(id)) if *id == missing));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let h = harness();
        let first = must(h.orch.create(CreateOptions::default()).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = must(h.orch.create(CreateOptions::default()).await);
        let ids: Vec<VmId> = must(h.orch.list().await).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, [second.id, first.id]);
    }

    #[tokio::test]
    async fn agent_wait_needs_running_vm() {
        let h = harness();
        let vm = must(h.orch.create(CreateOptions::default()).await);
        must(h.orch.stop(&vm.id).await);
        assert!(matches!(h.orch.wait_for_agent(&vm.id).await, Err(ExecutorError::VmNotRunning { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn proptest_concurrent_creates_get_distinct_slots(n in 1usize..24) {
            let rt = match tokio::runtime::Builder::new_multi_thread().worker_threads(4).enable_all().build() {
                Ok(rt) => rt,
                Err(e) => panic!("runtime: {e}"),
            };
            let h = harness();
            let slots: Vec<Slot> = rt.block_on(async {
                let mut tasks = tokio::task::JoinSet::new();
                for _ in 0..n {
                    let orch = h.orch.clone();
                    tasks.spawn(async move { orch.create(CreateOptions::default()).await });
                }
                let mut slots = Vec::new();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(Ok(record)) => slots.push(must(record.network.slot().map_err(ExecutorError::from))),
                        other => panic!("create failed: {other:?}"),
                    }
                }
                slots
            });
            let distinct: BTreeSet<Slot> = slots.iter().copied().collect();
            prop_assert_eq!(distinct.len(), n);
        }
    }
}
