//! Slot-derived network addressing and the policy model.
//!
//! Every VM owns one integer slot in `0..=254`. Its whole network identity
//! (TAP device, host/guest addresses, MAC, veth pair, transit addresses)
//! is a pure function of that slot:
//!
//! | item          | value                  |
//! |---------------|------------------------|
//! | TAP device    | `fhvm{s}`              |
//! | host address  | `172.16.{s}.1/30`      |
//! | guest address | `172.16.{s}.2/30`      |
//! | MAC           | `AA:FC:00:00:00:{s+1}` |
//! | veth (host)   | `veth-h-{s}`           |
//! | transit       | `10.200.{s}.1/30` ↔ `10.200.{s}.2/30` |

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Highest usable slot; the slot space is `0..=MAX_SLOT`.
pub const MAX_SLOT: u8 = 254;

/// Prefix of per-VM TAP device names.
pub const TAP_PREFIX: &str = "fhvm";

/// Prefix of the host end of per-VM veth pairs.
pub const VETH_HOST_PREFIX: &str = "veth-h-";

/// Prefix of the namespace end of per-VM veth pairs.
pub const VETH_GUEST_PREFIX: &str = "veth-g-";

/// Netmask of every per-VM link (`/30`).
pub const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);

/// Prefix length matching [`SUBNET_MASK`].
pub const SUBNET_PREFIX: u8 = 30;

/// The private block all VM links are carved from.
pub const VM_ADDRESS_BLOCK: Cidr = Cidr {
    addr: Ipv4Addr::new(172, 16, 0, 0),
    prefix: 16,
};

/// An index into the per-host network address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Slot(u8);

impl Slot {
    /// Creates a slot, rejecting `255`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidSlot`] if `value > MAX_SLOT`.
    pub fn new(value: u8) -> Result<Self, CoreError> {
        if value > MAX_SLOT {
            return Err(CoreError::InvalidSlot { value: value.to_string() });
        }
        Ok(Self(value))
    }

    /// Returns the raw slot number.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Iterates over every slot in ascending order.
    pub fn all() -> impl Iterator<Item = Slot> {
        (0..=MAX_SLOT).map(Slot)
    }

    /// `fhvm{slot}`
    #[must_use]
    pub fn tap_device(self) -> String {
        format!("{TAP_PREFIX}{}", self.0)
    }

    /// `172.16.{slot}.1`
    #[must_use]
    pub fn host_ip(self) -> Ipv4Addr {
        Ipv4Addr::new(172, 16, self.0, 1)
    }

    /// `172.16.{slot}.2`
    #[must_use]
    pub fn guest_ip(self) -> Ipv4Addr {
        Ipv4Addr::new(172, 16, self.0, 2)
    }

    /// The `/30` link network, `172.16.{slot}.0/30`.
    #[must_use]
    pub fn link_network(self) -> Cidr {
        Cidr {
            addr: Ipv4Addr::new(172, 16, self.0, 0),
            prefix: SUBNET_PREFIX,
        }
    }

    /// Locally administered MAC whose last octet is `slot + 1`.
    #[must_use]
    pub fn mac_address(self) -> String {
        format!("AA:FC:00:00:00:{:02X}", u16::from(self.0) + 1)
    }

    /// Host end of the veth pair.
    #[must_use]
    pub fn veth_host(self) -> String {
        format!("{VETH_HOST_PREFIX}{}", self.0)
    }

    /// Namespace end of the veth pair.
    #[must_use]
    pub fn veth_guest(self) -> String {
        format!("{VETH_GUEST_PREFIX}{}", self.0)
    }

    /// Host-side transit address, `10.200.{slot}.1`.
    #[must_use]
    pub fn transit_host_ip(self) -> Ipv4Addr {
        Ipv4Addr::new(10, 200, self.0, 1)
    }

    /// Namespace-side transit address, `10.200.{slot}.2`.
    #[must_use]
    pub fn transit_guest_ip(self) -> Ipv4Addr {
        Ipv4Addr::new(10, 200, self.0, 2)
    }

    /// Kernel command line with the static guest network configuration.
    ///
    /// The `ip=` parameter embeds guest address, gateway (host address),
    /// netmask, interface, and the host address as DNS server.
    #[must_use]
    pub fn boot_args(self) -> String {
        let host = self.host_ip();
        format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{host}:{SUBNET_MASK}::eth0:off:{host}",
            self.guest_ip()
        )
    }

    /// Recovers the slot from a host address of the form `172.16.{slot}.1`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidSlot`] if `ip` is not a host-side VM address.
    pub fn from_host_ip(ip: Ipv4Addr) -> Result<Self, CoreError> {
        let [a, b, c, d] = ip.octets();
        if a != 172 || b != 16 || d != 1 {
            return Err(CoreError::InvalidSlot { value: ip.to_string() });
        }
        Self::new(c)
    }

    /// Infers a slot from a live interface name (`fhvm{n}` or `veth-h-{n}`).
    #[must_use]
    pub fn from_interface_name(name: &str) -> Option<Self> {
        let digits = name
            .strip_prefix(TAP_PREFIX)
            .or_else(|| name.strip_prefix(VETH_HOST_PREFIX))?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u8>().ok().and_then(|n| Self::new(n).ok())
    }
}

impl TryFrom<u8> for Slot {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Slot> for u8 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An IPv4 network in `a.b.c.d/p` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// A single-address network (`/32`).
    #[must_use]
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, prefix: 32 }
    }

    /// Network address as written (not masked).
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` falls inside this network.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        (u32::from(self.addr) & mask) == (u32::from(ip) & mask)
    }
}

impl FromStr for Cidr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| CoreError::InvalidCidr { cidr: s.to_owned(), reason };

        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected format x.x.x.x/y"))?;

        let octets: Vec<&str> = ip.split('.').collect();
        let well_formed = octets.len() == 4
            && octets
                .iter()
                .all(|o| (1..=3).contains(&o.len()) && o.chars().all(|c| c.is_ascii_digit()))
            && (1..=2).contains(&prefix.len())
            && prefix.chars().all(|c| c.is_ascii_digit());
        if !well_formed {
            return Err(invalid("expected format x.x.x.x/y"));
        }

        let prefix: u8 = prefix.parse().map_err(|_| invalid("prefix length must be 0-32"))?;
        if prefix > 32 {
            return Err(invalid("prefix length must be 0-32"));
        }

        let mut bytes = [0u8; 4];
        for (slot, octet) in bytes.iter_mut().zip(&octets) {
            *slot = octet.parse().map_err(|_| invalid("each octet must be 0-255"))?;
        }

        Ok(Self { addr: Ipv4Addr::from(bytes), prefix })
    }
}

impl TryFrom<String> for Cidr {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(cidr: Cidr) -> Self {
        cidr.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Declared outbound policy for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum NetworkPolicy {
    /// Unrestricted egress apart from DNS funnelling and cross-VM isolation.
    #[default]
    AllowAll,
    /// No forwarded traffic at all.
    DenyAll,
    /// Allow/deny lists layered over the allow-all baseline.
    Custom,
}

impl NetworkPolicy {
    /// Kebab-case name as used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowAll => "allow-all",
            Self::DenyAll => "deny-all",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow-all" => Ok(Self::AllowAll),
            "deny-all" => Ok(Self::DenyAll),
            "custom" => Ok(Self::Custom),
            other => Err(CoreError::InvalidNetworkPolicy { value: other.to_owned() }),
        }
    }
}

/// The replaceable part of a VM's network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRules {
    /// Declared base policy.
    pub policy: NetworkPolicy,
    /// Domain patterns resolved through the host resolver.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Destinations accepted after cross-VM isolation.
    #[serde(default)]
    pub allowed_cidrs: Vec<Cidr>,
    /// Destinations dropped before anything else.
    #[serde(default)]
    pub denied_cidrs: Vec<Cidr>,
}

impl PolicyRules {
    /// Unrestricted rules with no lists.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny-all rules.
    #[must_use]
    pub fn deny_all() -> Self {
        Self { policy: NetworkPolicy::DenyAll, ..Self::default() }
    }

    fn has_lists(&self) -> bool {
        !self.allowed_domains.is_empty()
            || !self.allowed_cidrs.is_empty()
            || !self.denied_cidrs.is_empty()
    }

    /// Rejects deny-all combined with any list, then promotes allow-all to
    /// custom when lists are present.
    ///
    /// # Errors
    /// Returns [`CoreError::PolicyConflict`] for deny-all with lists.
    pub fn normalized(mut self) -> Result<Self, CoreError> {
        if self.policy == NetworkPolicy::DenyAll && self.has_lists() {
            return Err(CoreError::PolicyConflict);
        }
        if self.policy == NetworkPolicy::AllowAll && self.has_lists() {
            self.policy = NetworkPolicy::Custom;
        }
        Ok(self)
    }

    /// The rule set actually enforced.
    ///
    /// Deny-all wins outright; any non-empty list selects the custom rule
    /// set; otherwise the allow-all rule set applies.
    #[must_use]
    pub fn effective(&self) -> NetworkPolicy {
        if self.policy == NetworkPolicy::DenyAll {
            NetworkPolicy::DenyAll
        } else if self.has_lists() {
            NetworkPolicy::Custom
        } else {
            NetworkPolicy::AllowAll
        }
    }
}

/// The persisted network identity of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct NetworkIdentity {
    /// TAP device handed to the VMM.
    pub tap_device: String,
    /// Host end of the `/30` link; also the guest's gateway and resolver.
    pub host_ip: Ipv4Addr,
    /// Guest end of the `/30` link.
    pub guest_ip: Ipv4Addr,
    /// Always [`SUBNET_MASK`].
    pub subnet_mask: Ipv4Addr,
    /// Guest MAC address.
    pub mac_address: String,
    /// Declared policy.
    pub network_policy: NetworkPolicy,
    /// Domain allow-list.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// CIDR allow-list.
    #[serde(default)]
    pub allowed_cidrs: Vec<Cidr>,
    /// CIDR deny-list.
    #[serde(default)]
    pub denied_cidrs: Vec<Cidr>,
    /// Host ports forwarded to the same port on the guest.
    #[serde(default)]
    pub published_ports: Vec<u16>,
    /// Egress shaping rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbit: Option<u32>,
    /// Network namespace holding the TAP device, when isolation is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns_name: Option<String>,
    /// Host interface the NAT rules were bound to at setup. Teardown
    /// removes rules against this name even if the default route has
    /// since moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<String>,
}

impl NetworkIdentity {
    /// Derives the identity for `slot`.
    #[must_use]
    pub fn new(
        slot: Slot,
        rules: PolicyRules,
        published_ports: Vec<u16>,
        bandwidth_mbit: Option<u32>,
        netns_name: Option<String>,
    ) -> Self {
        Self {
            tap_device: slot.tap_device(),
            host_ip: slot.host_ip(),
            guest_ip: slot.guest_ip(),
            subnet_mask: SUBNET_MASK,
            mac_address: slot.mac_address(),
            network_policy: rules.policy,
            allowed_domains: rules.allowed_domains,
            allowed_cidrs: rules.allowed_cidrs,
            denied_cidrs: rules.denied_cidrs,
            published_ports,
            bandwidth_mbit,
            netns_name,
            uplink: None,
        }
    }

    /// Re-derives the slot from the host address.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidSlot`] if the stored address is not a VM
    /// host address.
    pub fn slot(&self) -> Result<Slot, CoreError> {
        Slot::from_host_ip(self.host_ip)
    }

    /// `guestIp/30`, the source network masqueraded on the uplink.
    #[must_use]
    pub fn guest_network(&self) -> Cidr {
        Cidr { addr: self.guest_ip, prefix: SUBNET_PREFIX }
    }

    /// The replaceable policy fields.
    #[must_use]
    pub fn rules(&self) -> PolicyRules {
        PolicyRules {
            policy: self.network_policy,
            allowed_domains: self.allowed_domains.clone(),
            allowed_cidrs: self.allowed_cidrs.clone(),
            denied_cidrs: self.denied_cidrs.clone(),
        }
    }

    /// Replaces the policy fields, leaving addressing untouched.
    pub fn set_rules(&mut self, rules: PolicyRules) {
        self.network_policy = rules.policy;
        self.allowed_domains = rules.allowed_domains;
        self.allowed_cidrs = rules.allowed_cidrs;
        self.denied_cidrs = rules.denied_cidrs;
    }
}
