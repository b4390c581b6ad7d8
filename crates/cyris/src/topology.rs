//! Network topology planning and Layer-3 policy synthesis
//!
//! Turns declared networks into range-local libvirt networks with
//! deterministic member IP assignment, and declared forwarding rules into
//! a per-range iptables chain. Rules are staged into the chain first and
//! only then jumped into FORWARD, so a half-applied policy is never
//! active; reverting removes the jump, flushes and deletes the chain.

use color_eyre::Result;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::description::{ForwardingRule, TopologySpec};
use crate::elevate::PrivilegedExecutor;
use crate::errors::{CyrisError, ErrorKind};
use crate::ledger::{Ledger, OpContext, OpKind};
use crate::libvirt::network::bridge_name;

/// First third octet of the free subnet pool (192.168.123.0/24), used
/// when a network declares no subnet.
pub const POOL_FIRST_OCTET3: u8 = 123;
/// Last third octet of the free subnet pool (192.168.200.0/24).
pub const POOL_LAST_OCTET3: u8 = 200;

/// Simple IPv4 CIDR arithmetic. Parsed once, used for gateway, netmask,
/// member addressing and containment checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/prefix`, normalizing the base to the network address.
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| CyrisError::Config(format!("{:?} is not CIDR notation", cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CyrisError::Config(format!("bad prefix length in {:?}", cidr)))?;
        if prefix > 30 {
            return Err(CyrisError::Config(format!(
                "prefix /{} leaves no room for hosts in {:?}",
                prefix, cidr
            ))
            .into());
        }
        let base = parse_ipv4(addr)? & mask(prefix);
        Ok(Self { base, prefix })
    }

    /// Gateway convention: first usable host.
    pub fn gateway(&self) -> String {
        format_ipv4(self.base + 1)
    }

    /// Dotted-quad netmask of the subnet.
    pub fn netmask(&self) -> String {
        format_ipv4(mask(self.prefix))
    }

    /// The nth member address, starting at `.2`.
    pub fn member_addr(&self, index: u32) -> Result<String> {
        let host = 2 + index;
        let capacity = (1u32 << (32 - self.prefix)) - 3; // network, gateway, broadcast
        if host > capacity + 1 {
            return Err(CyrisError::Network(format!(
                "subnet {} has no room for member {}",
                self.to_string(),
                index + 1
            ))
            .into());
        }
        Ok(format_ipv4(self.base + host))
    }

    /// Whether an address lies inside the subnet.
    pub fn contains(&self, addr: &str) -> bool {
        match parse_ipv4(addr) {
            Ok(ip) => ip & mask(self.prefix) == self.base,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", format_ipv4(self.base), self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn parse_ipv4(addr: &str) -> Result<u32> {
    let mut out: u32 = 0;
    let mut count = 0;
    for part in addr.split('.') {
        let octet: u8 = part
            .parse()
            .map_err(|_| CyrisError::Config(format!("{:?} is not an IPv4 address", addr)))?;
        out = (out << 8) | octet as u32;
        count += 1;
    }
    if count != 4 {
        return Err(CyrisError::Config(format!("{:?} is not an IPv4 address", addr)).into());
    }
    Ok(out)
}

fn format_ipv4(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff
    )
}

/// Allocates subnets for networks that declared none.
#[derive(Debug, Default)]
pub struct SubnetPool {
    used: HashSet<String>,
}

impl SubnetPool {
    /// An empty pool with nothing reserved.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a declared subnet as taken.
    pub fn reserve(&mut self, cidr: &str) {
        self.used.insert(cidr.to_string());
    }

    /// First free pool subnet.
    pub fn allocate(&mut self) -> Result<String> {
        for octet3 in POOL_FIRST_OCTET3..=POOL_LAST_OCTET3 {
            let candidate = format!("192.168.{}.0/24", octet3);
            if self.used.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(CyrisError::Network("subnet pool exhausted".into()).into())
    }
}

/// One member interface's assigned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    /// Cloned VM name
    pub vm_name: String,
    /// Guest template the VM was cloned from
    pub guest_id: String,
    /// Interface name inside the guest
    pub iface: String,
    /// Assigned address
    pub ip: String,
}

/// A fully planned range network.
#[derive(Debug, Clone)]
pub struct PlannedNetwork {
    /// Declared name (`office`)
    pub name: String,
    /// Bridge / libvirt network name (`cr-br-<range>-office`)
    pub bridge: String,
    /// The network's subnet
    pub cidr: Cidr,
    /// Member addresses, in deterministic order
    pub assignments: Vec<IpAssignment>,
}

/// Plan all networks of one topology block. `instances` maps each guest
/// id to its cloned VM names; every instance of a member guest gets an
/// address. Assignment order is deterministic: members sorted by
/// (guest_id, iface), then instance order.
pub fn plan_networks(
    range_id: &str,
    topology: &TopologySpec,
    instances: &BTreeMap<String, Vec<String>>,
    pool: &mut SubnetPool,
) -> Result<Vec<PlannedNetwork>> {
    // Reserve declared subnets before allocating free ones, so a declared
    // pool address is never handed out twice.
    for network in &topology.networks {
        if let Some(ref subnet) = network.subnet {
            pool.reserve(subnet);
        }
    }

    let mut planned = Vec::new();
    for network in &topology.networks {
        let subnet = match network.subnet {
            Some(ref subnet) => subnet.clone(),
            None => pool.allocate()?,
        };
        let cidr = Cidr::parse(&subnet)?;

        let mut members = network.members.clone();
        members.sort_by(|a, b| (&a.guest_id, &a.iface).cmp(&(&b.guest_id, &b.iface)));

        let mut assignments = Vec::new();
        for member in &members {
            let vm_names = instances.get(&member.guest_id).ok_or_else(|| {
                CyrisError::Network(format!(
                    "member {:?} has no cloned instances",
                    member.guest_id
                ))
            })?;
            for vm_name in vm_names {
                let ip = cidr.member_addr(assignments.len() as u32)?;
                assignments.push(IpAssignment {
                    vm_name: vm_name.clone(),
                    guest_id: member.guest_id.clone(),
                    iface: member.iface.clone(),
                    ip,
                });
            }
        }

        planned.push(PlannedNetwork {
            name: network.name.clone(),
            bridge: bridge_name(range_id, &network.name),
            cidr,
            assignments,
        });
    }
    Ok(planned)
}

/// Flatten planned assignments into the `tags.ip_assignments` map
/// (`<vm_name>.<iface>` to address).
pub fn assignment_map(networks: &[PlannedNetwork]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for network in networks {
        for a in &network.assignments {
            map.insert(format!("{}.{}", a.vm_name, a.iface), a.ip.clone());
        }
    }
    map
}

/// iptables chain names are capped at 28 characters.
const CHAIN_PREFIX: &str = "CYRIS-FWD-";
const CHAIN_MAX: usize = 28;

/// Per-range forwarding chain name.
pub fn chain_name(range_id: &str) -> String {
    let room = CHAIN_MAX - CHAIN_PREFIX.len();
    let id: String = range_id.chars().take(room).collect();
    format!("{}{}", CHAIN_PREFIX, id)
}

/// A staged firewall policy: the chain plus its rule argument vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPlan {
    /// Per-range chain name
    pub chain: String,
    /// iptables argument vectors, without the binary name
    pub rules: Vec<Vec<String>>,
}

/// Synthesize the stateful accept rules for the declared forwarding
/// rules: one rule per (src CIDR, dst CIDR) pair plus one
/// related/established catch-all.
pub fn build_firewall_plan(
    range_id: &str,
    rules: &[ForwardingRule],
    networks: &[PlannedNetwork],
) -> Result<FirewallPlan> {
    let chain = chain_name(range_id);
    let mut staged: Vec<Vec<String>> = Vec::new();

    for rule in rules {
        let src_cidrs = cidrs_of(networks, &rule.src_network)?;
        let dst_cidrs = cidrs_of(networks, &rule.dst_network)?;
        for src in &src_cidrs {
            for dst in &dst_cidrs {
                let mut args = vec![
                    "-A".to_string(),
                    chain.clone(),
                    "-s".to_string(),
                    src.clone(),
                    "-d".to_string(),
                    dst.clone(),
                    "-p".to_string(),
                    rule.protocol.clone(),
                ];
                if let Some(ref sport) = rule.sport {
                    args.push("--sport".to_string());
                    args.push(sport.clone());
                }
                if let Some(ref dport) = rule.dport {
                    args.push("--dport".to_string());
                    args.push(dport.clone());
                }
                args.extend(
                    [
                        "-m",
                        "state",
                        "--state",
                        "NEW,ESTABLISHED,RELATED",
                        "-j",
                        "ACCEPT",
                    ]
                    .map(String::from),
                );
                staged.push(args);
            }
        }
    }

    staged.push(
        [
            "-A",
            chain.as_str(),
            "-m",
            "state",
            "--state",
            "ESTABLISHED,RELATED",
            "-j",
            "ACCEPT",
        ]
        .map(String::from)
        .to_vec(),
    );

    Ok(FirewallPlan {
        chain,
        rules: staged,
    })
}

fn cidrs_of(networks: &[PlannedNetwork], name: &str) -> Result<Vec<String>> {
    let matching: Vec<String> = networks
        .iter()
        .filter(|n| n.name == name)
        .map(|n| n.cidr.to_string())
        .collect();
    if matching.is_empty() {
        return Err(CyrisError::Network(format!(
            "forwarding rule references unknown network {:?}",
            name
        ))
        .into());
    }
    Ok(matching)
}

/// Apply a staged plan: create the chain, fill it, then atomically swap
/// it into FORWARD by inserting the jump as the last step. On any
/// failure the already-applied pieces are reverted before returning.
pub fn apply_firewall(
    ledger: &Ledger,
    elevate: &PrivilegedExecutor,
    ctx: &OpContext,
    plan: &FirewallPlan,
) -> Result<()> {
    let ctx = ctx.clone().failing_as(ErrorKind::Network);

    let steps: Vec<Vec<String>> = std::iter::once(vec!["-N".to_string(), plan.chain.clone()])
        .chain(plan.rules.iter().cloned())
        .chain(std::iter::once(vec![
            "-I".to_string(),
            "FORWARD".to_string(),
            "1".to_string(),
            "-j".to_string(),
            plan.chain.clone(),
        ]))
        .collect();

    for step in &steps {
        let args: Vec<&str> = step.iter().map(|s| s.as_str()).collect();
        let mut cmd = elevate.wrap("iptables", &args);
        if let Err(e) = ledger.run_logged(&mut cmd, OpKind::Shell, &ctx) {
            revert_firewall(ledger, elevate, &ctx, &plan.chain);
            return Err(e);
        }
    }
    Ok(())
}

/// Remove the per-range chain and its FORWARD jump. Errors are recorded
/// but never raised, so teardown always makes forward progress.
pub fn revert_firewall(
    ledger: &Ledger,
    elevate: &PrivilegedExecutor,
    ctx: &OpContext,
    chain: &str,
) {
    let ctx = ctx.clone().ignoring_errors();
    let steps: [&[&str]; 3] = [
        &["-D", "FORWARD", "-j", chain],
        &["-F", chain],
        &["-X", chain],
    ];
    for step in steps {
        let mut cmd = elevate.wrap("iptables", step);
        let _ = ledger.run_logged(&mut cmd, OpKind::Shell, &ctx);
    }
}

/// Render the plan as the lines `iptables-save` would show; used by the
/// status command and tests.
pub fn render_save_lines(plan: &FirewallPlan) -> Vec<String> {
    plan.rules.iter().map(|args| args.join(" ")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{MemberRef, NetworkSpec, RuleSpec};

    fn topology() -> TopologySpec {
        TopologySpec {
            kind: "custom".to_string(),
            networks: vec![
                NetworkSpec {
                    name: "office".to_string(),
                    subnet: Some("192.168.10.0/24".to_string()),
                    members: vec![
                        MemberRef {
                            guest_id: "desktop".to_string(),
                            iface: "eth0".to_string(),
                        },
                        MemberRef {
                            guest_id: "admin".to_string(),
                            iface: "eth0".to_string(),
                        },
                    ],
                },
                NetworkSpec {
                    name: "dmz".to_string(),
                    subnet: Some("192.168.20.0/24".to_string()),
                    members: vec![MemberRef {
                        guest_id: "web".to_string(),
                        iface: "eth0".to_string(),
                    }],
                },
            ],
            forwarding_rules: vec![RuleSpec {
                rule: "src=office dst=dmz dport=80".to_string(),
            }],
        }
    }

    fn instances() -> BTreeMap<String, Vec<String>> {
        let mut map = BTreeMap::new();
        map.insert("desktop".to_string(), vec!["cyris-desktop-aaa".to_string()]);
        map.insert("admin".to_string(), vec!["cyris-admin-bbb".to_string()]);
        map.insert("web".to_string(), vec!["cyris-web-ccc".to_string()]);
        map
    }

    #[test]
    fn test_cidr_math() {
        let cidr = Cidr::parse("192.168.10.0/24").unwrap();
        assert_eq!(cidr.gateway(), "192.168.10.1");
        assert_eq!(cidr.netmask(), "255.255.255.0");
        assert_eq!(cidr.member_addr(0).unwrap(), "192.168.10.2");
        assert_eq!(cidr.member_addr(5).unwrap(), "192.168.10.7");
        assert!(cidr.contains("192.168.10.200"));
        assert!(!cidr.contains("192.168.11.2"));
        assert_eq!(cidr.to_string(), "192.168.10.0/24");

        // Non-aligned base is normalized
        let cidr = Cidr::parse("10.1.2.77/16").unwrap();
        assert_eq!(cidr.to_string(), "10.1.0.0/16");

        assert!(Cidr::parse("192.168.10.0").is_err());
        assert!(Cidr::parse("not-an-ip/24").is_err());
        assert!(Cidr::parse("10.0.0.0/31").is_err());
    }

    #[test]
    fn test_member_assignment_is_sorted_and_unique() {
        let mut pool = SubnetPool::new();
        let planned = plan_networks("tid", &topology(), &instances(), &mut pool).unwrap();
        assert_eq!(planned.len(), 2);

        let office = &planned[0];
        assert_eq!(office.bridge, "cr-br-tid-office");
        // Sorted by guest id: admin before desktop
        assert_eq!(office.assignments[0].guest_id, "admin");
        assert_eq!(office.assignments[0].ip, "192.168.10.2");
        assert_eq!(office.assignments[1].guest_id, "desktop");
        assert_eq!(office.assignments[1].ip, "192.168.10.3");

        // Every ip is inside its subnet and unique
        let mut seen = HashSet::new();
        for network in &planned {
            for a in &network.assignments {
                assert!(network.cidr.contains(&a.ip));
                assert!(seen.insert(a.ip.clone()));
            }
        }

        let map = assignment_map(&planned);
        assert_eq!(map.get("cyris-desktop-aaa.eth0").unwrap(), "192.168.10.3");
        assert_eq!(map.get("cyris-web-ccc.eth0").unwrap(), "192.168.20.2");
    }

    #[test]
    fn test_pool_allocation_skips_declared() {
        let mut pool = SubnetPool::new();
        pool.reserve("192.168.123.0/24");
        assert_eq!(pool.allocate().unwrap(), "192.168.124.0/24");
        assert_eq!(pool.allocate().unwrap(), "192.168.125.0/24");
    }

    #[test]
    fn test_unspecified_subnet_comes_from_pool() {
        let mut topo = topology();
        topo.networks[1].subnet = None;
        let mut pool = SubnetPool::new();
        let planned = plan_networks("tid", &topo, &instances(), &mut pool).unwrap();
        assert_eq!(planned[1].cidr.to_string(), "192.168.123.0/24");
    }

    #[test]
    fn test_firewall_plan_shape() {
        let mut pool = SubnetPool::new();
        let planned = plan_networks("tid", &topology(), &instances(), &mut pool).unwrap();
        let rules = topology().parsed_rules().unwrap();
        let plan = build_firewall_plan("tid", &rules, &planned).unwrap();

        assert_eq!(plan.chain, "CYRIS-FWD-tid");
        assert_eq!(plan.rules.len(), 2);

        let accept = plan.rules[0].join(" ");
        assert_eq!(
            accept,
            "-A CYRIS-FWD-tid -s 192.168.10.0/24 -d 192.168.20.0/24 -p tcp \
             --dport 80 -m state --state NEW,ESTABLISHED,RELATED -j ACCEPT"
        );
        let catch_all = plan.rules[1].join(" ");
        assert_eq!(
            catch_all,
            "-A CYRIS-FWD-tid -m state --state ESTABLISHED,RELATED -j ACCEPT"
        );
    }

    #[test]
    fn test_sport_and_protocol_rendering() {
        let rules = vec![ForwardingRule {
            src_network: "office".to_string(),
            dst_network: "office".to_string(),
            sport: Some("1024".to_string()),
            dport: Some("22".to_string()),
            protocol: "tcp".to_string(),
        }];
        let mut pool = SubnetPool::new();
        let planned = plan_networks("tid", &topology(), &instances(), &mut pool).unwrap();
        let plan = build_firewall_plan("tid", &rules, &planned).unwrap();
        let line = plan.rules[0].join(" ");
        assert!(line.contains("--sport 1024"));
        assert!(line.contains("--dport 22"));
        assert!(line.contains("-p tcp"));
    }

    #[test]
    fn test_chain_name_respects_iptables_limit() {
        let chain = chain_name("a-very-long-range-identifier-indeed");
        assert!(chain.len() <= CHAIN_MAX);
        assert!(chain.starts_with(CHAIN_PREFIX));
        assert_eq!(chain_name("tid"), "CYRIS-FWD-tid");
    }

    #[test]
    fn test_unknown_network_in_rule() {
        let rules = vec![ForwardingRule {
            src_network: "nope".to_string(),
            dst_network: "office".to_string(),
            sport: None,
            dport: None,
            protocol: "tcp".to_string(),
        }];
        let mut pool = SubnetPool::new();
        let planned = plan_networks("tid", &topology(), &instances(), &mut pool).unwrap();
        assert!(build_firewall_plan("tid", &rules, &planned).is_err());
    }
}
