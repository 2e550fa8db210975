use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use super::rules::RuleOp;
use super::{NetScope, NetworkBackend, RouteDest, Rule};
use crate::command::{Cmd, CommandRunner};
use crate::ExecutorError;

/// [`NetworkBackend`] backed by iproute2, iptables, tc and sysctl.
#[derive(Debug, Clone)]
pub struct SystemNetwork {
    runner: Arc<dyn CommandRunner>,
    sysfs_net: PathBuf,
}

impl SystemNetwork {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner, sysfs_net: PathBuf::from("/sys/class/net") }
    }

    /// Privileged command in `scope`.
    fn cmd<I, S>(scope: &NetScope, program: &str, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match scope {
            NetScope::Host => Cmd::sudo(program).args(args),
            NetScope::Namespace(ns) => Cmd::sudo("ip")
                .args(["netns", "exec", ns.as_str(), program])
                .args(args),
        }
    }

    /// `iptables` waiting on the host-wide xtables lock instead of failing
    /// when another VM's setup or teardown holds it.
    fn iptables(scope: &NetScope, rule: &Rule, op: RuleOp) -> Cmd {
        Self::cmd(scope, "iptables", std::iter::once("-w".to_owned()).chain(rule.to_args(op)))
    }

    fn run(&self, cmd: &Cmd) -> Result<(), ExecutorError> {
        self.runner.run(cmd).map(drop)
    }

    fn route_dest(dest: RouteDest) -> String {
        match dest {
            RouteDest::Default => "default".to_owned(),
            RouteDest::Net(cidr) => cidr.to_string(),
        }
    }
}

/// Extracts `X` from the first `dev X` pair in `ip route show default` output.
fn parse_default_dev(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_owned);
        }
    }
    None
}

/// Token-bucket burst: one eighth of the rate in kbit, at least 32 kb.
fn burst_kb(mbit: u32) -> u32 {
    (mbit.saturating_mul(1000) / 8).max(32)
}

impl NetworkBackend for SystemNetwork {
    fn create_namespace(&self, name: &str) -> Result<(), ExecutorError> {
        self.run(&Cmd::sudo("ip").args(["netns", "add", name]))
    }

    fn delete_namespace(&self, name: &str) -> Result<(), ExecutorError> {
        self.run(&Cmd::sudo("ip").args(["netns", "delete", name]))
    }

    fn create_veth_pair(&self, host_end: &str, peer: &str, namespace: &str) -> Result<(), ExecutorError> {
        self.run(&Cmd::sudo("ip").args(["link", "add", host_end, "type", "veth", "peer", "name", peer]))?;
        self.run(&Cmd::sudo("ip").args(["link", "set", peer, "netns", namespace]))
    }

    fn create_tap(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError> {
        self.run(&Self::cmd(scope, "ip", ["tuntap", "add", "dev", name, "mode", "tap"]))
    }

    fn delete_link(&self, scope: &NetScope, name: &str) -> Result<(), ExecutorError> {
        self.run(&Self::cmd(scope, "ip", ["link", "delete", name]))
    }

    fn add_address(&self, scope: &NetScope, dev: &str, addr: Ipv4Addr, prefix: u8) -> Result<(), ExecutorError> {
        let cidr = format!("{addr}/{prefix}");
        self.run(&Self::cmd(scope, "ip", ["addr", "add", cidr.as_str(), "dev", dev]))
    }

    fn set_link_up(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError> {
        self.run(&Self::cmd(scope, "ip", ["link", "set", dev, "up"]))
    }

    fn add_route(&self, scope: &NetScope, dest: RouteDest, via: Ipv4Addr) -> Result<(), ExecutorError> {
        let dest = Self::route_dest(dest);
        let via = via.to_string();
        self.run(&Self::cmd(scope, "ip", ["route", "add", dest.as_str(), "via", via.as_str()]))
    }

    fn delete_route(&self, scope: &NetScope, dest: RouteDest) -> Result<(), ExecutorError> {
        let dest = Self::route_dest(dest);
        self.run(&Self::cmd(scope, "ip", ["route", "del", dest.as_str()]))
    }

    fn enable_forwarding(&self, scope: &NetScope) -> Result<(), ExecutorError> {
        self.run(&Self::cmd(scope, "sysctl", ["-w", "net.ipv4.ip_forward=1"]))
    }

    fn add_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError> {
        self.run(&Self::iptables(scope, rule, RuleOp::Add))
    }

    fn delete_rule(&self, scope: &NetScope, rule: &Rule) -> Result<(), ExecutorError> {
        self.run(&Self::iptables(scope, rule, RuleOp::Delete))
    }

    fn set_rate_limit(&self, scope: &NetScope, dev: &str, mbit: u32) -> Result<(), ExecutorError> {
        let rate = format!("{mbit}mbit");
        let burst = format!("{}kb", burst_kb(mbit));
        self.run(&Self::cmd(
            scope,
            "tc",
            ["qdisc", "add", "dev", dev, "root", "tbf", "rate", rate.as_str(), "burst", burst.as_str(), "latency", "400ms"],
        ))
    }

    fn clear_rate_limit(&self, scope: &NetScope, dev: &str) -> Result<(), ExecutorError> {
        self.run(&Self::cmd(scope, "tc", ["qdisc", "del", "dev", dev, "root"]))
    }

    fn default_interface(&self) -> Result<String, ExecutorError> {
        let out = self.runner.run(&Cmd::new("ip").args(["route", "show", "default"]))?;
        parse_default_dev(&out).ok_or(ExecutorError::DefaultInterfaceNotFound)
    }

    fn interfaces(&self) -> Result<Vec<String>, ExecutorError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.sysfs_net)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}
