//! Packet-filter rule model and the policy compiler.
//!
//! Rules are plain data so the full rule set for a VM can be computed,
//! compared, and evaluated without touching the host. [`compile`] is the
//! single source of truth for which rules a policy installs.

use std::net::{Ipv4Addr, SocketAddrV4};

use husk_core::network::VM_ADDRESS_BLOCK;
use husk_core::{Cidr, NetworkIdentity, NetworkPolicy};

/// Well-known DNS-over-HTTPS/QUIC resolver addresses blocked on port 443
/// (Google, Cloudflare, Quad9, OpenDNS, CleanBrowsing).
///
/// This list is not exhaustive. A guest can still reach self-hosted or
/// less common DoH endpoints, so domain policy is best-effort.
pub const DOH_RESOLVERS: [Ipv4Addr; 10] = [
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
    Ipv4Addr::new(9, 9, 9, 9),
    Ipv4Addr::new(149, 112, 112, 112),
    Ipv4Addr::new(208, 67, 222, 222),
    Ipv4Addr::new(208, 67, 220, 220),
    Ipv4Addr::new(185, 228, 168, 168),
    Ipv4Addr::new(185, 228, 169, 168),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Forward,
    Prerouting,
    Postrouting,
}

impl Chain {
    fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Prerouting => "PREROUTING",
            Self::Postrouting => "POSTROUTING",
        }
    }
}

/// Where a new rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Append,
    Insert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Accept,
    Drop,
    Masquerade,
    Dnat(SocketAddrV4),
}

/// Which network stack a rule is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// The stack holding the TAP device: the VM's namespace when one
    /// exists, otherwise the host.
    Forwarding,
    /// Always the host (NAT, port publishing).
    Host,
}

/// One iptables rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: Table,
    pub chain: Chain,
    pub position: Position,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub source: Option<Cidr>,
    pub destination: Option<Cidr>,
    pub protocol: Option<Protocol>,
    pub dport: Option<u16>,
    pub established: bool,
    pub target: Target,
}

/// Whether arguments are produced for insertion or deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Delete,
}

impl Rule {
    fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            position: Position::Append,
            in_iface: None,
            out_iface: None,
            source: None,
            destination: None,
            protocol: None,
            dport: None,
            established: false,
            target,
        }
    }

    fn forward(target: Target) -> Self {
        Self::new(Table::Filter, Chain::Forward, target)
    }

    fn inserted(mut self) -> Self {
        self.position = Position::Insert;
        self
    }

    fn from_iface(mut self, iface: &str) -> Self {
        self.in_iface = Some(iface.to_owned());
        self
    }

    fn to_iface(mut self, iface: &str) -> Self {
        self.out_iface = Some(iface.to_owned());
        self
    }

    fn src(mut self, cidr: Cidr) -> Self {
        self.source = Some(cidr);
        self
    }

    fn dst(mut self, cidr: Cidr) -> Self {
        self.destination = Some(cidr);
        self
    }

    fn port(mut self, protocol: Protocol, port: u16) -> Self {
        self.protocol = Some(protocol);
        self.dport = Some(port);
        self
    }

    /// `iptables` arguments (without the program name).
    #[must_use]
    pub fn to_args(&self, op: RuleOp) -> Vec<String> {
        fn addr(cidr: &Cidr) -> String {
            if cidr.prefix() == 32 {
                cidr.addr().to_string()
            } else {
                cidr.to_string()
            }
        }

        let mut args = Vec::with_capacity(16);
        if self.table == Table::Nat {
            args.extend(["-t".to_owned(), "nat".to_owned()]);
        }
        let flag = match (op, self.position) {
            (RuleOp::Delete, _) => "-D",
            (RuleOp::Add, Position::Append) => "-A",
            (RuleOp::Add, Position::Insert) => "-I",
        };
        args.extend([flag.to_owned(), self.chain.as_str().to_owned()]);

        if let Some(src) = &self.source {
            args.extend(["-s".to_owned(), addr(src)]);
        }
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_owned(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            args.extend(["-o".to_owned(), iface.clone()]);
        }
        if let Some(dst) = &self.destination {
            args.extend(["-d".to_owned(), addr(dst)]);
        }
        if let Some(proto) = self.protocol {
            args.extend(["-p".to_owned(), proto.as_str().to_owned()]);
        }
        if let Some(port) = self.dport {
            args.extend(["--dport".to_owned(), port.to_string()]);
        }
        if self.established {
            args.extend(
                ["-m", "state", "--state", "RELATED,ESTABLISHED"].map(str::to_owned),
            );
        }

        match self.target {
            Target::Accept => args.extend(["-j".to_owned(), "ACCEPT".to_owned()]),
            Target::Drop => args.extend(["-j".to_owned(), "DROP".to_owned()]),
            Target::Masquerade => args.extend(["-j".to_owned(), "MASQUERADE".to_owned()]),
            Target::Dnat(to) => args.extend([
                "-j".to_owned(),
                "DNAT".to_owned(),
                "--to-destination".to_owned(),
                to.to_string(),
            ]),
        }
        args
    }

    /// Whether this rule matches `packet` (connection state is ignored
    /// unless the packet is marked as a reply).
    #[must_use]
    pub fn matches(&self, packet: &Packet) -> bool {
        self.in_iface.as_ref().is_none_or(|i| packet.in_iface == *i)
            && self.out_iface.as_ref().is_none_or(|o| packet.out_iface == *o)
            && self.source.is_none_or(|s| s.contains(packet.src))
            && self.destination.is_none_or(|d| d.contains(packet.dst))
            && self.protocol.is_none_or(|p| packet.protocol == p)
            && self.dport.is_none_or(|p| packet.dport == p)
            && (!self.established || packet.reply)
    }
}

/// A forwarded packet, for evaluating a rule chain without a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub in_iface: String,
    pub out_iface: String,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: Protocol,
    pub dport: u16,
    pub reply: bool,
}

impl Packet {
    /// Outbound packet leaving the guest through `tap`.
    #[must_use]
    pub fn outbound(identity: &NetworkIdentity, dst: Ipv4Addr, protocol: Protocol, dport: u16) -> Self {
        Self {
            in_iface: identity.tap_device.clone(),
            out_iface: "uplink".to_owned(),
            src: identity.guest_ip,
            dst,
            protocol,
            dport,
            reply: false,
        }
    }
}

/// Outcome of running a packet through a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// No rule matched; the chain policy decides.
    Unmatched,
}

/// First-match evaluation of an ordered `FORWARD` chain.
#[must_use]
pub fn evaluate<'a>(chain: impl IntoIterator<Item = &'a Rule>, packet: &Packet) -> Verdict {
    chain
        .into_iter()
        .filter(|r| r.table == Table::Filter && r.chain == Chain::Forward)
        .find(|r| r.matches(packet))
        .map_or(Verdict::Unmatched, |r| match r.target {
            Target::Drop => Verdict::Drop,
            _ => Verdict::Accept,
        })
}

/// Rules to install for `identity`, in installation order.
///
/// Rules that need the host's uplink (masquerade, published-port DNAT) are
/// omitted when `uplink` is `None`; callers that install rules must supply
/// it for every policy except deny-all.
#[must_use]
pub fn compile(identity: &NetworkIdentity, uplink: Option<&str>) -> Vec<(Placement, Rule)> {
    let tap = identity.tap_device.as_str();
    let host = Cidr::host(identity.host_ip);
    let guest = Cidr::host(identity.guest_ip);
    let policy = identity.rules().effective();

    let mut out = Vec::new();
    let mut fwd = |rule: Rule| out.push((Placement::Forwarding, rule));

    if policy == NetworkPolicy::DenyAll {
        fwd(Rule::forward(Target::Drop).inserted().from_iface(tap));
        fwd(Rule::forward(Target::Drop).inserted().to_iface(tap));
        return out;
    }

    let custom = policy == NetworkPolicy::Custom;

    if custom {
        for cidr in &identity.denied_cidrs {
            fwd(Rule::forward(Target::Drop).from_iface(tap).dst(*cidr));
        }
    }

    for proto in [Protocol::Udp, Protocol::Tcp] {
        fwd(Rule::forward(Target::Accept).from_iface(tap).dst(host).port(proto, 53));
    }
    for port in [53, 853] {
        for proto in [Protocol::Udp, Protocol::Tcp] {
            fwd(Rule::forward(Target::Drop).from_iface(tap).port(proto, port));
        }
    }
    for ip in DOH_RESOLVERS {
        for proto in [Protocol::Tcp, Protocol::Udp] {
            fwd(Rule::forward(Target::Drop).from_iface(tap).dst(Cidr::host(ip)).port(proto, 443));
        }
    }
    fwd(Rule::forward(Target::Drop).from_iface(tap).dst(VM_ADDRESS_BLOCK));
    if custom {
        for cidr in &identity.allowed_cidrs {
            fwd(Rule::forward(Target::Accept).from_iface(tap).dst(*cidr));
        }
    }
    fwd(Rule::forward(Target::Accept).from_iface(tap));

    let mut established = Rule::forward(Target::Accept).to_iface(tap);
    established.established = true;
    fwd(established);

    if let Some(uplink) = uplink {
        let link = identity.guest_network();
        out.insert(
            0,
            (
                Placement::Host,
                Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade)
                    .src(link)
                    .to_iface(uplink),
            ),
        );
    }

    for &port in &identity.published_ports {
        if let Some(uplink) = uplink {
            out.push((
                Placement::Host,
                Rule::new(
                    Table::Nat,
                    Chain::Prerouting,
                    Target::Dnat(SocketAddrV4::new(identity.guest_ip, port)),
                )
                .from_iface(uplink)
                .port(Protocol::Tcp, port),
            ));
        }
        out.push((
            Placement::Host,
            Rule::forward(Target::Accept).dst(guest).port(Protocol::Tcp, port),
        ));
    }

    out
}
