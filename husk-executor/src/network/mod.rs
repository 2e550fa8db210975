//! Per-VM network isolation.
//!
//! [`NetworkEngine`] drives a [`NetworkBackend`] through namespace, link,
//! filter-rule, and shaping setup for one VM, and replaces its filter
//! policy in place with rollback. The backend is the only thing that
//! touches the host; [`SystemNetwork`] implements it with `ip`, `iptables`,
//! `tc` and `sysctl`.

pub mod rules;
mod system;

use std::net::Ipv4Addr;
use std::sync::Arc;

use husk_core::{Cidr, NetworkIdentity, NetworkPolicy, PolicyRules, Slot};

pub use rules::{Placement, Rule};
pub use system::SystemNetwork;

use crate::ExecutorError;

/// The network stack an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetScope {
    Host,
    Namespace(String),
}

/// Destination of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDest {
    Default,
    Net(Cidr),
}

/// Typed host network operations.
///
/// Every method is a single idempotence-agnostic mutation; callers decide
/// whether a failure is fatal (setup) or ignorable (teardown).
pub trait NetworkBackend: Send + Sync {
    /// # Errors
    /// Fails if the namespace exists or cannot be created.
    fn create_namespace(&self, name: &str) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the namespace does not exist.
    fn delete_namespace(&self, name: &str) -> Result<(), ExecutorError>;

    /// Creates a veth pair on the host and moves `peer` into `namespace`.
    ///
    /// # Errors
    /// Fails if either end exists or the move fails.
    fn create_veth_pair(&self, host_end: &str, peer: &str, namespace: &str) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the TAP device cannot be created.
    fn create_tap(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the link does not exist.
    fn delete_link(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the address cannot be assigned.
    fn add_address(&self, scope: &NetScope, dev: &str, addr: Ipv4Addr, prefix: u8) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the link does not exist.
    fn set_link_up(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the route exists or the gateway is unreachable.
    fn add_route(&self, scope: &NetScope, dest: RouteDest, via: Ipv4Addr) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the route does not exist.
    fn delete_route(&self, scope: &NetScope, dest: RouteDest) -> Result<(), ExecutorError>;

    /// Enables IPv4 forwarding.
    ///
    /// # Errors
    /// Fails if the sysctl cannot be written.
    fn enable_forwarding(&self, scope: &NetScope) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if the rule is rejected.
    fn add_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if no matching rule exists.
    fn delete_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError>;

    /// Installs a token-bucket egress limit on `dev`.
    ///
    /// # Errors
    /// Fails if the qdisc cannot be added.
    fn set_rate_limit(&self, scope: &NetScope, dev: &str, mbit: u32) -> Result<(), ExecutorError>;

    /// # Errors
    /// Fails if no root qdisc exists.
    fn clear_rate_limit(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError>;

    /// Name of the interface carrying the host default route.
    ///
    /// # Errors
    /// Returns [`ExecutorError::DefaultInterfaceNotFound`] if there is none.
    fn default_interface(&self) -> Result<String, ExecutorError>;

    /// Names of every interface in the host namespace.
    ///
    /// # Errors
    /// Fails if the interface list cannot be read.
    fn interfaces(&self) -> Result<Vec<String>, ExecutorError>;
}

/// Network namespace name for a VM.
#[must_use]
pub fn netns_name(vm_id: &husk_core::VmId) -> String {
    format!("husk-{vm_id}")
}

/// Drives one VM's network resources.
pub struct NetworkEngine {
    identity: NetworkIdentity,
    slot: Slot,
    backend: Arc<dyn NetworkBackend>,
}

impl std::fmt::Debug for NetworkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEngine").field("identity", &self.identity).finish_non_exhaustive()
    }
}

impl NetworkEngine {
    /// Wraps an existing identity.
    ///
    /// # Errors
    /// Returns a validation error if the identity's host address does not
    /// encode a slot.
    pub fn new(identity: NetworkIdentity, backend: Arc<dyn NetworkBackend>) -> Result<Self, ExecutorError> {
        let slot = identity.slot()?;
        Ok(Self { identity, slot, backend })
    }

    #[must_use]
    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    #[must_use]
    pub fn into_identity(self) -> NetworkIdentity {
        self.identity
    }

    fn forwarding_scope(&self) -> NetScope {
        self.identity
            .netns_name
            .as_ref()
            .map_or(NetScope::Host, |ns| NetScope::Namespace(ns.clone()))
    }

    fn scope_of(&self, placement: Placement) -> NetScope {
        match placement {
            Placement::Forwarding => self.forwarding_scope(),
            Placement::Host => NetScope::Host,
        }
    }

    /// Binds the identity to the host's current uplink. Deny-all installs
    /// no NAT and records none.
    ///
    /// # Errors
    /// [`ExecutorError::DefaultInterfaceNotFound`] if NAT is needed and the
    /// host has no default route.
    pub fn resolve_uplink(&mut self) -> Result<(), ExecutorError> {
        self.identity.uplink = if self.identity.rules().effective() == NetworkPolicy::DenyAll {
            None
        } else {
            Some(self.backend.default_interface()?)
        };
        Ok(())
    }

    /// Creates namespace, links, filter rules and shaping, in that order.
    ///
    /// Stops at the first failure; the caller is expected to run
    /// [`teardown`](Self::teardown) to release whatever was created.
    ///
    /// # Errors
    /// Propagates the first failing backend operation.
    pub fn setup(&mut self) -> Result<(), ExecutorError> {
        tracing::info!(
            slot = %self.slot,
            tap = %self.identity.tap_device,
            netns = ?self.identity.netns_name,
            policy = %self.identity.rules().effective(),
            "setting up VM network"
        );
        self.setup_namespace()?;
        self.setup_device()?;
        self.apply_rules()?;
        self.setup_rate_limit()
    }

    fn setup_namespace(&self) -> Result<(), ExecutorError> {
        let Some(ns) = &self.identity.netns_name else {
            return Ok(());
        };
        let b = &*self.backend;
        let host = NetScope::Host;
        let inner = NetScope::Namespace(ns.clone());
        let (veth_host, veth_guest) = (self.slot.veth_host(), self.slot.veth_guest());

        b.create_namespace(ns)?;
        b.create_veth_pair(&veth_host, &veth_guest, ns)?;
        b.add_address(&host, &veth_host, self.slot.transit_host_ip(), 30)?;
        b.set_link_up(&host, &veth_host)?;
        b.add_address(&inner, &veth_guest, self.slot.transit_guest_ip(), 30)?;
        b.set_link_up(&inner, &veth_guest)?;
        b.set_link_up(&inner, "lo")?;
        b.add_route(&inner, RouteDest::Default, self.slot.transit_host_ip())?;
        b.enable_forwarding(&inner)?;
        b.add_route(&host, RouteDest::Net(self.slot.link_network()), self.slot.transit_guest_ip())?;
        b.enable_forwarding(&host)
    }

    fn setup_device(&self) -> Result<(), ExecutorError> {
        let b = &*self.backend;
        let scope = self.forwarding_scope();
        let tap = &self.identity.tap_device;

        if scope == NetScope::Host && b.interfaces()?.iter().any(|i| i == tap) {
            if let Err(e) = b.delete_link(&scope, tap) {
                tracing::warn!(tap = %tap, error = %e, "could not remove leftover TAP device");
            }
        }

        b.create_tap(&scope, tap)?;
        b.add_address(&scope, tap, self.identity.host_ip, husk_core::network::SUBNET_PREFIX)?;
        b.set_link_up(&scope, tap)?;
        if scope == NetScope::Host {
            b.enable_forwarding(&scope)?;
        }
        Ok(())
    }

    /// Installs the compiled rule set for the current policy, resolving the
    /// uplink first unless one is already recorded.
    fn apply_rules(&mut self) -> Result<(), ExecutorError> {
        if self.identity.uplink.is_none() {
            self.resolve_uplink()?;
        }
        for (placement, rule) in rules::compile(&self.identity, self.identity.uplink.as_deref()) {
            self.backend.add_rule(&self.scope_of(placement), &rule)?;
        }
        Ok(())
    }

    /// Best-effort removal of the current rule set.
    ///
    /// With `include_namespaced == false`, rules living inside the VM
    /// namespace are left for namespace deletion to discard.
    fn remove_rules(&self, include_namespaced: bool) {
        // Records written before the uplink was persisted fall back to the
        // current default route.
        let uplink = match &self.identity.uplink {
            Some(iface) => Some(iface.clone()),
            None if self.identity.rules().effective() == NetworkPolicy::DenyAll => None,
            None => match self.backend.default_interface() {
                Ok(iface) => Some(iface),
                Err(e) => {
                    tracing::debug!(error = %e, "no uplink; skipping NAT rule removal");
                    None
                }
            },
        };
        for (placement, rule) in rules::compile(&self.identity, uplink.as_deref()) {
            let scope = self.scope_of(placement);
            if !include_namespaced && scope != NetScope::Host {
                continue;
            }
            if let Err(e) = self.backend.delete_rule(&scope, &rule) {
                tracing::debug!(error = %e, "rule already absent");
            }
        }
    }

    fn setup_rate_limit(&self) -> Result<(), ExecutorError> {
        match self.identity.bandwidth_mbit {
            Some(mbit) => self.backend.set_rate_limit(&self.forwarding_scope(), &self.identity.tap_device, mbit),
            None => Ok(()),
        }
    }

    /// Releases every resource [`setup`](Self::setup) may have created.
    ///
    /// Never fails: each step is attempted independently and failures are
    /// logged. With a namespace, deleting it discards the TAP device and
    /// every rule inside; only host-side rules and the host route need
    /// explicit removal.
    pub fn teardown(&self) {
        let b = &*self.backend;
        let warn = |step: &str, r: Result<(), ExecutorError>| {
            if let Err(e) = r {
                tracing::debug!(slot = %self.slot, step, error = %e, "teardown step skipped");
            }
        };

        match &self.identity.netns_name {
            Some(ns) => {
                self.remove_rules(false);
                warn("route", b.delete_route(&NetScope::Host, RouteDest::Net(self.slot.link_network())));
                warn("namespace", b.delete_namespace(ns));
                if b.interfaces().is_ok_and(|ifs| ifs.contains(&self.slot.veth_host())) {
                    warn("veth", b.delete_link(&NetScope::Host, &self.slot.veth_host()));
                }
            }
            None => {
                warn("rate-limit", b.clear_rate_limit(&NetScope::Host, &self.identity.tap_device));
                self.remove_rules(true);
                warn("tap", b.delete_link(&NetScope::Host, &self.identity.tap_device));
            }
        }
        tracing::info!(slot = %self.slot, "VM network torn down");
    }

    /// Replaces the filter policy without touching links or namespace.
    ///
    /// On failure the previous policy is restored and re-applied before
    /// the original error is returned, so the device is not left
    /// unfiltered.
    ///
    /// # Errors
    /// Returns the error that made the new policy fail, or
    /// [`ExecutorError::PolicyRollbackFailed`] if restoring the old policy
    /// failed as well.
    pub fn update_policy(&mut self, vm_id: &husk_core::VmId, new_rules: PolicyRules) -> Result<(), ExecutorError> {
        let previous = self.identity.rules();
        let previous_uplink = self.identity.uplink.clone();
        tracing::info!(
            vm_id = %vm_id,
            from = %previous.effective(),
            to = %new_rules.effective(),
            "replacing network policy"
        );

        self.remove_rules(true);
        self.identity.set_rules(new_rules);
        self.identity.uplink = None;

        let Err(cause) = self.apply_rules() else {
            return Ok(());
        };

        tracing::warn!(vm_id = %vm_id, error = %cause, "policy apply failed; restoring previous rules");
        self.remove_rules(true);
        self.identity.set_rules(previous);
        self.identity.uplink = previous_uplink;

        match self.apply_rules() {
            Ok(()) => Err(cause),
            Err(rollback) => {
                tracing::error!(vm_id = %vm_id, error = %rollback, "policy rollback failed; VM has no enforced policy");
                Err(ExecutorError::PolicyRollbackFailed {
                    vm_id: vm_id.clone(),
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use husk_core::{Cidr, VmId};

    use super::rules::{Packet, Protocol, Verdict};
    use super::*;
    use crate::testing::FakeNetwork;

    fn identity(rules: PolicyRules, netns: Option<&str>) -> NetworkIdentity {
        let slot = match Slot::new(2) {
            Ok(s) => s,
            Err(e) => panic!("slot: {e}"),
        };
        NetworkIdentity::new(slot, rules, vec![8080], Some(10), netns.map(str::to_owned))
    }

    fn engine(id: NetworkIdentity, fake: &Arc<FakeNetwork>) -> NetworkEngine {
        let backend: Arc<dyn NetworkBackend> = fake.clone();
        match NetworkEngine::new(id, backend) {
            Ok(e) => e,
            Err(e) => panic!("engine: {e}"),
        }
    }

    fn cidr(s: &str) -> Cidr {
        match s.parse() {
            Ok(c) => c,
            Err(e) => panic!("{s}: {e}"),
        }
    }

    fn must(r: Result<(), ExecutorError>) {
        if let Err(e) = r {
            panic!("unexpected error: {e}");
        }
    }

    #[test]
    fn namespaced_setup_keeps_forward_rules_inside_namespace() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), Some("husk-vm-1")), &fake);
        must(eng.setup());

        let ns = NetScope::Namespace("husk-vm-1".to_owned());
        assert!(fake.namespaces().contains("husk-vm-1"));
        assert!(fake.links(&ns).contains(&"fhvm2".to_owned()), "TAP must live in the namespace");
        assert!(fake.links(&NetScope::Host).contains(&"veth-h-2".to_owned()));
        assert!(!fake.rules(&ns).is_empty());
        assert!(
            fake.rules(&NetScope::Host).iter().all(|r| r.chain != rules::Chain::Forward
                || r.in_iface.is_none()),
            "per-VM FORWARD filtering must not leak onto the host"
        );
        assert_eq!(fake.rate_limit(&ns, "fhvm2"), Some(10));
    }

    #[test]
    fn namespaced_teardown_deletes_namespace_and_host_rules() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), Some("husk-vm-1")), &fake);
        must(eng.setup());
        eng.teardown();

        assert!(fake.namespaces().is_empty());
        assert!(fake.rules(&NetScope::Host).is_empty(), "host NAT/DNAT rules must be removed");
        assert!(!fake.links(&NetScope::Host).contains(&"veth-h-2".to_owned()));
        assert!(fake.routes(&NetScope::Host).is_empty());
    }

    #[test]
    fn host_teardown_removes_every_rule_and_the_tap() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), None), &fake);
        must(eng.setup());
        assert!(fake.links(&NetScope::Host).contains(&"fhvm2".to_owned()));
        eng.teardown();
        assert!(fake.rules(&NetScope::Host).is_empty());
        assert!(!fake.links(&NetScope::Host).contains(&"fhvm2".to_owned()));
        assert_eq!(fake.rate_limit(&NetScope::Host, "fhvm2"), None);
    }

    #[test]
    fn teardown_uses_the_uplink_recorded_at_setup() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), None), &fake);
        must(eng.setup());
        assert_eq!(eng.identity().uplink.as_deref(), Some("eth0"));
        assert!(fake.rules(&NetScope::Host).iter().any(|r| r.out_iface.as_deref() == Some("eth0")));

        fake.set_uplink(Some("wlan0"));
        eng.teardown();
        assert!(fake.rules(&NetScope::Host).is_empty(), "NAT bound to the old uplink must be removed");
    }

    #[test]
    fn deny_all_records_no_uplink() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::deny_all(), None), &fake);
        must(eng.resolve_uplink());
        assert_eq!(eng.identity().uplink, None);
    }

    #[test]
    fn teardown_is_safe_to_repeat() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::deny_all(), None), &fake);
        must(eng.setup());
        eng.teardown();
        eng.teardown();
        assert!(fake.rules(&NetScope::Host).is_empty());
    }

    #[test]
    fn deny_all_setup_installs_no_nat() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::deny_all(), None), &fake);
        must(eng.setup());
        let host = fake.rules(&NetScope::Host);
        assert_eq!(host.len(), 2);
        assert!(host.iter().all(|r| r.table == rules::Table::Filter));
    }

    #[test]
    fn setup_without_uplink_fails_unless_deny_all() {
        let fake = Arc::new(FakeNetwork::default());
        fake.set_uplink(None);
        let mut eng = engine(identity(PolicyRules::allow_all(), None), &fake);
        assert!(matches!(eng.setup(), Err(ExecutorError::DefaultInterfaceNotFound)));

        let fake = Arc::new(FakeNetwork::default());
        fake.set_uplink(None);
        let mut eng = engine(identity(PolicyRules::deny_all(), None), &fake);
        must(eng.setup());
    }

    #[test]
    fn policy_update_replaces_rules_in_namespace() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), Some("husk-vm-1")), &fake);
        must(eng.setup());
        let ns = NetScope::Namespace("husk-vm-1".to_owned());

        must(eng.update_policy(&VmId::generate(), PolicyRules::deny_all()));
        assert_eq!(fake.rules(&ns).len(), 2, "old rules must not accumulate");
        assert!(fake.rules(&NetScope::Host).is_empty(), "deny-all keeps no host NAT");
        assert_eq!(eng.identity().network_policy, NetworkPolicy::DenyAll);
    }

    #[test]
    fn failed_policy_update_restores_previous_behaviour() {
        let fake = Arc::new(FakeNetwork::default());
        let old = PolicyRules {
            policy: NetworkPolicy::Custom,
            denied_cidrs: vec![cidr("203.0.113.0/24")],
            ..PolicyRules::default()
        };
        let mut eng = engine(identity(old.clone(), None), &fake);
        must(eng.setup());

        let probes = [
            Ipv4Addr::new(203, 0, 113, 7),
            Ipv4Addr::new(198, 51, 100, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(172, 16, 9, 2),
        ];
        let verdicts = |eng: &NetworkEngine| -> Vec<Verdict> {
            probes
                .iter()
                .map(|ip| fake.evaluate(&NetScope::Host, &Packet::outbound(eng.identity(), *ip, Protocol::Tcp, 443)))
                .collect()
        };
        let before = verdicts(&eng);

        let new = PolicyRules {
            policy: NetworkPolicy::Custom,
            allowed_cidrs: vec![cidr("198.51.100.0/24")],
            ..PolicyRules::default()
        };
        fake.fail_rules_matching(Some(cidr("198.51.100.0/24")));

        let result = eng.update_policy(&VmId::generate(), new);
        assert!(matches!(result, Err(ExecutorError::CommandFailed { .. })), "got {result:?}");
        assert_eq!(eng.identity().rules(), old, "in-memory policy must roll back");
        assert_eq!(verdicts(&eng), before, "enforced rule set must match the pre-update policy");
    }

    #[test]
    fn failed_rollback_is_reported() {
        let fake = Arc::new(FakeNetwork::default());
        let mut eng = engine(identity(PolicyRules::allow_all(), None), &fake);
        must(eng.setup());
        fake.fail_all_rules(true);

        let result = eng.update_policy(&VmId::generate(), PolicyRules::deny_all());
        assert!(matches!(result, Err(ExecutorError::PolicyRollbackFailed { .. })), "got {result:?}");
    }
}
