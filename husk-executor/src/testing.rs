//! In-memory fakes of every host seam, for tests that must not need root,
//! KVM, or real namespaces.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use husk_core::{Cidr, NetworkIdentity, PolicyRules, Slot, VmId, VmRecord, VmStatus, DEFAULT_AGENT_PORT};

use crate::backend::{BootConfig, RestoreConfig, VmmBackend};
use crate::command::{Cmd, CommandOutput, CommandRunner};
use crate::error::TimeoutTarget;
use crate::jail::{JailBackend, JailPaths, PrepareRequest, SpawnRequest};
use crate::network::rules::{self, Packet, Position, Verdict};
use crate::network::{NetScope, NetworkBackend, Rule, RouteDest};
use crate::process::{is_vm_process, ProcessTable, VMM_MARKER};
use crate::ExecutorError;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn refused(what: impl std::fmt::Display, why: &str) -> ExecutorError {
    ExecutorError::CommandFailed { command: what.to_string(), status: "exit 1".to_owned(), stderr: why.to_owned() }
}

/// A record with a fresh id holding `slot`.
#[must_use]
pub fn sample_record(slot: Slot, status: VmStatus) -> VmRecord {
    let id = VmId::generate();
    let root = PathBuf::from("/tmp/husk-test/jailer/firecracker").join(id.as_str()).join("root");
    VmRecord {
        project: String::new(),
        runtime: "base".to_owned(),
        disk_size_gb: None,
        status,
        pid: (status == VmStatus::Running).then_some(4242),
        api_socket: root.join("run/firecracker.socket"),
        chroot_dir: root,
        kernel: PathBuf::from("/tmp/husk-test/kernels/vmlinux"),
        rootfs: PathBuf::from("/tmp/husk-test/rootfs/base.ext4"),
        vcpu_count: 1,
        mem_size_mib: 128,
        network: NetworkIdentity::new(slot, PolicyRules::allow_all(), vec![], None, None),
        snapshot: None,
        timeout_ms: None,
        timeout_at: None,
        created_at: Utc::now(),
        error: None,
        agent_token: None,
        agent_port: DEFAULT_AGENT_PORT,
        id,
    }
}

/// [`CommandRunner`] that records every command and answers from a script.
///
/// Unscripted commands succeed with empty output. Scripted answers match by
/// prefix of the rendered command line, first registration wins.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    log: Mutex<Vec<String>>,
    script: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    fn script(&self, prefix: &str, output: CommandOutput) {
        locked(&self.script).push((prefix.to_owned(), output));
    }

    /// Succeed with `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.script(prefix, CommandOutput { code: Some(0), stdout: stdout.to_owned(), stderr: String::new() });
    }

    /// Exit 1 with `stderr`.
    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.exit_with(prefix, 1, stderr);
    }

    pub fn exit_with(&self, prefix: &str, code: i32, stderr: &str) {
        self.script(prefix, CommandOutput { code: Some(code), stdout: String::new(), stderr: stderr.to_owned() });
    }

    /// Rendered command lines, in execution order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        locked(&self.log).clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn output(&self, cmd: &Cmd) -> Result<CommandOutput, ExecutorError> {
        let line = cmd.to_string();
        locked(&self.log).push(line.clone());
        let scripted = locked(&self.script)
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone());
        Ok(scripted.unwrap_or(CommandOutput { code: Some(0), ..CommandOutput::default() }))
    }
}

#[derive(Debug)]
struct NetState {
    namespaces: BTreeSet<String>,
    links: HashMap<NetScope, Vec<String>>,
    rules: HashMap<NetScope, Vec<Rule>>,
    routes: HashMap<NetScope, Vec<RouteDest>>,
    rate_limits: HashMap<(NetScope, String), u32>,
    uplink: Option<String>,
    fail_cidr: Option<Cidr>,
    fail_all_rules: bool,
}

impl Default for NetState {
    fn default() -> Self {
        Self {
            namespaces: BTreeSet::new(),
            links: HashMap::new(),
            rules: HashMap::new(),
            routes: HashMap::new(),
            rate_limits: HashMap::new(),
            uplink: Some("eth0".to_owned()),
            fail_cidr: None,
            fail_all_rules: false,
        }
    }
}

impl NetState {
    fn check_scope(&self, scope: &NetScope) -> Result<(), ExecutorError> {
        match scope {
            NetScope::Namespace(ns) if !self.namespaces.contains(ns) => Err(refused(ns, "no such namespace")),
            _ => Ok(()),
        }
    }

    fn has_link(&self, scope: &NetScope, name: &str) -> bool {
        self.links.get(scope).is_some_and(|l| l.iter().any(|n| n == name))
    }
}

/// [`NetworkBackend`] keeping namespaces, links, routes, shaping and
/// per-scope rule chains in memory.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<NetState>,
}

impl FakeNetwork {
    fn state(&self) -> MutexGuard<'_, NetState> {
        locked(&self.state)
    }

    /// Interface reported as carrying the default route.
    pub fn set_uplink(&self, uplink: Option<&str>) {
        self.state().uplink = uplink.map(str::to_owned);
    }

    /// Makes every rule add naming `cidr` as source or destination fail.
    pub fn fail_rules_matching(&self, cidr: Option<Cidr>) {
        self.state().fail_cidr = cidr;
    }

    /// Makes every rule add fail.
    pub fn fail_all_rules(&self, fail: bool) {
        self.state().fail_all_rules = fail;
    }

    #[must_use]
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state().namespaces.clone()
    }

    #[must_use]
    pub fn links(&self, scope: &NetScope) -> Vec<String> {
        self.state().links.get(scope).cloned().unwrap_or_default()
    }

    /// The chain as installed, first rule first.
    #[must_use]
    pub fn rules(&self, scope: &NetScope) -> Vec<Rule> {
        self.state().rules.get(scope).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn routes(&self, scope: &NetScope) -> Vec<RouteDest> {
        self.state().routes.get(scope).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn rate_limit(&self, scope: &NetScope, dev: &str) -> Option<u32> {
        self.state().rate_limits.get(&(scope.clone(), dev.to_owned())).copied()
    }

    /// Runs `packet` through the installed `FORWARD` chain of `scope`.
    #[must_use]
    pub fn evaluate(&self, scope: &NetScope, packet: &Packet) -> Verdict {
        rules::evaluate(&self.rules(scope), packet)
    }
}

impl NetworkBackend for FakeNetwork {
    fn create_namespace(&self, name: &str) -> Result<(), ExecutorError> {
        if self.state().namespaces.insert(name.to_owned()) {
            Ok(())
        } else {
            Err(refused(name, "namespace exists"))
        }
    }

    fn delete_namespace(&self, name: &str) -> Result<(), ExecutorError> {
        let mut s = self.state();
        if !s.namespaces.remove(name) {
            return Err(refused(name, "no such namespace"));
        }
        let scope = NetScope::Namespace(name.to_owned());
        s.links.remove(&scope);
        s.rules.remove(&scope);
        s.routes.remove(&scope);
        s.rate_limits.retain(|(sc, _), _| *sc != scope);
        Ok(())
    }

    fn create_veth_pair(&self, host_end: &str, peer: &str, namespace: &str) -> Result<(), ExecutorError> {
        let mut s = self.state();
        let inner = NetScope::Namespace(namespace.to_owned());
        s.check_scope(&inner)?;
        if s.has_link(&NetScope::Host, host_end) {
            return Err(refused(host_end, "link exists"));
        }
        s.links.entry(NetScope::Host).or_default().push(host_end.to_owned());
        s.links.entry(inner).or_default().push(peer.to_owned());
        Ok(())
    }

    fn create_tap(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError> {
        let mut s = self.state();
        s.check_scope(scope)?;
        if s.has_link(scope, name) {
            return Err(refused(name, "link exists"));
        }
        s.links.entry(scope.clone()).or_default().push(name.to_owned());
        Ok(())
    }

    fn delete_link(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError> {
        let mut s = self.state();
        let links = s.links.entry(scope.clone()).or_default();
        let Some(pos) = links.iter().position(|n| n == name) else {
            return Err(refused(name, "no such link"));
        };
        links.remove(pos);
        s.rate_limits.remove(&(scope.clone(), name.to_owned()));
        Ok(())
    }

    fn add_address(&self, scope: &NetScope, dev: &str, _addr: Ipv4Addr, _prefix: u8) -> Result<(), ExecutorError> {
        let s = self.state();
        s.check_scope(scope)?;
        if s.has_link(scope, dev) {
            Ok(())
        } else {
            Err(refused(dev, "no such link"))
        }
    }

    fn set_link_up(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError> {
        let s = self.state();
        s.check_scope(scope)?;
        if dev == "lo" || s.has_link(scope, dev) {
            Ok(())
        } else {
            Err(refused(dev, "no such link"))
        }
    }

    fn add_route(&self, scope: &NetScope, dest: RouteDest, _via: Ipv4Addr) -> Result<(), ExecutorError> {
        let mut s = self.state();
        s.check_scope(scope)?;
        let routes = s.routes.entry(scope.clone()).or_default();
        if routes.contains(&dest) {
            return Err(refused("ip route add", "route exists"));
        }
        routes.push(dest);
        Ok(())
    }

    fn delete_route(&self, scope: &NetScope, dest: RouteDest) -> Result<(), ExecutorError> {
        let mut s = self.state();
        let routes = s.routes.entry(scope.clone()).or_default();
        let Some(pos) = routes.iter().position(|r| *r == dest) else {
            return Err(refused("ip route del", "no such route"));
        };
        routes.remove(pos);
        Ok(())
    }

    fn enable_forwarding(&self, scope: &NetScope) -> Result<(), ExecutorError> {
        self.state().check_scope(scope)
    }

    fn add_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError> {
        let mut s = self.state();
        s.check_scope(scope)?;
        let poisoned = s.fail_cidr.is_some_and(|c| rule.source == Some(c) || rule.destination == Some(c));
        if s.fail_all_rules || poisoned {
            return Err(refused("iptables", "injected rule failure"));
        }
        let chain = s.rules.entry(scope.clone()).or_default();
        match rule.position {
            Position::Insert => chain.insert(0, rule.clone()),
            Position::Append => chain.push(rule.clone()),
        }
        Ok(())
    }

    fn delete_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError> {
        let mut s = self.state();
        let chain = s.rules.entry(scope.clone()).or_default();
        let Some(pos) = chain.iter().position(|r| r == rule) else {
            return Err(refused("iptables -D", "Bad rule (does a matching rule exist in that chain?)"));
        };
        chain.remove(pos);
        Ok(())
    }

    fn set_rate_limit(&self, scope: &NetScope, dev: &str, mbit: u32) -> Result<(), ExecutorError> {
        let mut s = self.state();
        s.check_scope(scope)?;
        s.rate_limits.insert((scope.clone(), dev.to_owned()), mbit);
        Ok(())
    }

    fn clear_rate_limit(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError> {
        match self.state().rate_limits.remove(&(scope.clone(), dev.to_owned())) {
            Some(_) => Ok(()),
            None => Err(refused(dev, "no root qdisc")),
        }
    }

    fn default_interface(&self) -> Result<String, ExecutorError> {
        self.state().uplink.clone().ok_or(ExecutorError::DefaultInterfaceNotFound)
    }

    fn interfaces(&self) -> Result<Vec<String>, ExecutorError> {
        Ok(self.links(&NetScope::Host))
    }
}

/// [`ProcessTable`] over a map of pid to command line.
#[derive(Debug)]
pub struct FakeProcesses {
    table: Mutex<BTreeMap<u32, String>>,
    killed: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
}

impl Default for FakeProcesses {
    fn default() -> Self {
        Self { table: Mutex::default(), killed: Mutex::default(), next_pid: AtomicU32::new(1000) }
    }
}

impl FakeProcesses {
    pub fn spawn(&self, pid: u32, cmdline: &str) {
        locked(&self.table).insert(pid, cmdline.to_owned());
    }

    /// Starts a process with the next free pid.
    pub fn spawn_next(&self, cmdline: &str) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawn(pid, cmdline);
        pid
    }

    /// Every pid that was alive when killed, in order.
    #[must_use]
    pub fn killed(&self) -> Vec<u32> {
        locked(&self.killed).clone()
    }

    #[must_use]
    pub fn running(&self) -> usize {
        locked(&self.table).len()
    }
}

impl ProcessTable for FakeProcesses {
    fn find(&self, marker: &str, vm_id: &VmId) -> Option<u32> {
        locked(&self.table)
            .iter()
            .find(|(_, cmdline)| {
                let argv: Vec<&str> = cmdline.split_whitespace().collect();
                is_vm_process(&argv, marker, vm_id)
            })
            .map(|(pid, _)| *pid)
    }

    fn kill(&self, pid: u32) -> Result<bool, ExecutorError> {
        let existed = locked(&self.table).remove(&pid).is_some();
        if existed {
            locked(&self.killed).push(pid);
        }
        Ok(existed)
    }

    fn is_alive(&self, pid: u32) -> bool {
        locked(&self.table).contains_key(&pid)
    }
}

/// How a scripted [`FakeJail::spawn`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFault {
    /// Leftover device node; recoverable.
    StaleDevice,
    /// Any other wrapper failure.
    Fatal,
}

#[derive(Debug, Default)]
struct JailState {
    prepared: Vec<PrepareRequest>,
    spawns: Vec<SpawnRequest>,
    faults: VecDeque<SpawnFault>,
    prepare_error: Option<String>,
    clears: u32,
    force_clears: u32,
}

/// [`JailBackend`] that builds the directory layout on disk and launches
/// VMM processes into a shared [`FakeProcesses`].
#[derive(Debug)]
pub struct FakeJail {
    procs: Arc<FakeProcesses>,
    state: Mutex<JailState>,
}

impl FakeJail {
    #[must_use]
    pub fn new(procs: Arc<FakeProcesses>) -> Self {
        Self { procs, state: Mutex::default() }
    }

    /// Queues failures for upcoming spawns, consumed in order.
    pub fn fail_spawns(&self, faults: impl IntoIterator<Item = SpawnFault>) {
        locked(&self.state).faults.extend(faults);
    }

    pub fn fail_prepare(&self, message: &str) {
        locked(&self.state).prepare_error = Some(message.to_owned());
    }

    #[must_use]
    pub fn prepared(&self) -> Vec<PrepareRequest> {
        locked(&self.state).prepared.clone()
    }

    #[must_use]
    pub fn spawns(&self) -> Vec<SpawnRequest> {
        locked(&self.state).spawns.clone()
    }

    #[must_use]
    pub fn clear_count(&self) -> u32 {
        locked(&self.state).clears
    }

    #[must_use]
    pub fn force_clear_count(&self) -> u32 {
        locked(&self.state).force_clears
    }
}

impl JailBackend for FakeJail {
    fn prepare(&self, paths: &JailPaths, request: &PrepareRequest) -> Result<(), ExecutorError> {
        for dir in ["kernel", "rootfs", "run"] {
            std::fs::create_dir_all(paths.root_dir.join(dir))?;
        }
        std::fs::write(paths.kernel(), b"kernel")?;
        std::fs::write(paths.rootfs(), b"rootfs")?;
        let mut s = locked(&self.state);
        s.prepared.push(request.clone());
        match &s.prepare_error {
            Some(message) => Err(refused("mount -o loop", message)),
            None => Ok(()),
        }
    }

    fn spawn(&self, vm_id: &VmId, paths: &JailPaths, request: &SpawnRequest) -> Result<(), ExecutorError> {
        let fault = {
            let mut s = locked(&self.state);
            s.spawns.push(request.clone());
            s.faults.pop_front()
        };
        match fault {
            Some(SpawnFault::StaleDevice) => {
                return Err(ExecutorError::StaleDeviceNode { vm_id: vm_id.clone(), detail: "dev/kvm: File exists".to_owned() })
            }
            Some(SpawnFault::Fatal) => return Err(ExecutorError::SpawnFailed("jailer: invalid argument".to_owned())),
            None => {}
        }
        let pid = self.procs.spawn_next(&format!("{VMM_MARKER} --id {vm_id} --api-sock run/firecracker.socket"));
        std::fs::create_dir_all(&paths.root_dir)?;
        std::fs::write(paths.pid_file(), pid.to_string())?;
        Ok(())
    }

    fn clear_stale(&self, paths: &JailPaths) -> Result<(), ExecutorError> {
        locked(&self.state).clears += 1;
        for file in [paths.socket(), paths.pid_file()] {
            match std::fs::remove_file(file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn force_clear_devices(&self, _paths: &JailPaths) -> Result<(), ExecutorError> {
        locked(&self.state).force_clears += 1;
        Ok(())
    }

    fn remove(&self, paths: &JailPaths) {
        for dir in [&paths.root_dir, &paths.jail_dir] {
            // Best-effort, like the real provisioner.
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

#[derive(Debug, Default)]
struct VmmState {
    socket_faults: u32,
    boot_error: Option<u16>,
    socket_waits: Vec<Duration>,
    boots: Vec<BootConfig>,
    restores: Vec<RestoreConfig>,
}

/// [`VmmBackend`] recording every call.
#[derive(Debug, Default)]
pub struct FakeVmm {
    state: Mutex<VmmState>,
}

impl FakeVmm {
    /// The next `n` socket waits time out.
    pub fn fail_socket_waits(&self, n: u32) {
        locked(&self.state).socket_faults = n;
    }

    /// Every boot is rejected with `status`.
    pub fn reject_boot(&self, status: u16) {
        locked(&self.state).boot_error = Some(status);
    }

    /// Timeout passed to each socket wait, in order.
    #[must_use]
    pub fn socket_waits(&self) -> Vec<Duration> {
        locked(&self.state).socket_waits.clone()
    }

    #[must_use]
    pub fn boots(&self) -> Vec<BootConfig> {
        locked(&self.state).boots.clone()
    }

    #[must_use]
    pub fn restores(&self) -> Vec<RestoreConfig> {
        locked(&self.state).restores.clone()
    }
}

#[async_trait]
impl VmmBackend for FakeVmm {
    async fn wait_for_socket(&self, socket: &std::path::Path, timeout: Duration) -> Result<(), ExecutorError> {
        let mut s = locked(&self.state);
        s.socket_waits.push(timeout);
        if s.socket_faults > 0 {
            s.socket_faults -= 1;
            return Err(ExecutorError::timeout(TimeoutTarget::Socket, socket.display(), timeout));
        }
        Ok(())
    }

    async fn boot(&self, _socket: &std::path::Path, config: &BootConfig) -> Result<(), ExecutorError> {
        let mut s = locked(&self.state);
        if let Some(status) = s.boot_error {
            return Err(ExecutorError::ApiError {
                method: "PUT".to_owned(),
                path: "/boot-source".to_owned(),
                status,
                body: "{\"fault_message\":\"rejected\"}".to_owned(),
            });
        }
        s.boots.push(config.clone());
        Ok(())
    }

    async fn restore(&self, _socket: &std::path::Path, snapshot: &RestoreConfig) -> Result<(), ExecutorError> {
        locked(&self.state).restores.push(snapshot.clone());
        Ok(())
    }
}
