//! Guest IP discovery
//!
//! Cloned guests get addresses from the topology plan, but a VM that was
//! provisioned outside the current process (or a range restored from disk)
//! still needs its address discovered. Methods run in fixed priority
//! order; the first hit wins and lower-priority methods are never
//! consulted. Results carry the method and a confidence value and are
//! cached briefly; the cache is dropped on every orchestrator state
//! transition that could change addressing.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use itertools::Itertools as _;
use regex::Regex;
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::CyrisError;
use crate::libvirt::Connection;

/// Canonical dnsmasq lease file locations, checked in order.
const DNSMASQ_LEASE_PATHS: &[&str] = &[
    "/var/lib/libvirt/dnsmasq",
    "/var/lib/misc/dnsmasq.leases",
];

/// Discovery method, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionMethod {
    /// Assignment recorded in the ranges metadata document
    TopologyMetadata,
    /// Hypervisor lease API (`domifaddr --source lease`)
    HypervisorLease,
    /// Plain hypervisor CLI query
    HypervisorCli,
    /// Host ARP table scan by domain MAC
    ArpScan,
    /// dnsmasq lease file scan by domain MAC
    DhcpLeases,
    /// Neighbor scan over the range bridges
    BridgeScan,
}

impl ResolutionMethod {
    /// Every method, in resolution priority order.
    pub const ALL: [ResolutionMethod; 6] = [
        ResolutionMethod::TopologyMetadata,
        ResolutionMethod::HypervisorLease,
        ResolutionMethod::HypervisorCli,
        ResolutionMethod::ArpScan,
        ResolutionMethod::DhcpLeases,
        ResolutionMethod::BridgeScan,
    ];

    /// Stable name used in reports and the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::TopologyMetadata => "topology_metadata",
            ResolutionMethod::HypervisorLease => "hypervisor_lease",
            ResolutionMethod::HypervisorCli => "hypervisor_cli",
            ResolutionMethod::ArpScan => "arp_scan",
            ResolutionMethod::DhcpLeases => "dhcp_leases",
            ResolutionMethod::BridgeScan => "bridge_scan",
        }
    }

    /// How trustworthy a hit from this method is.
    pub fn confidence(&self) -> f32 {
        match self {
            ResolutionMethod::TopologyMetadata => 1.0,
            ResolutionMethod::HypervisorLease => 0.95,
            ResolutionMethod::HypervisorCli => 0.9,
            ResolutionMethod::ArpScan => 0.8,
            ResolutionMethod::DhcpLeases => 0.7,
            ResolutionMethod::BridgeScan => 0.5,
        }
    }
}

/// A successful discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIp {
    /// The discovered address
    pub ip: String,
    /// Method that produced it
    pub method: ResolutionMethod,
    /// The method's confidence
    pub confidence: f32,
}

/// Strip the `cyris-` prefix and `-<uuid12>` suffix from a cloned VM
/// name, recovering the guest id. Returns `None` when the name does not
/// follow the cloning convention.
pub fn guest_id_from_vm_name(vm_name: &str) -> Option<&str> {
    let rest = vm_name.strip_prefix("cyris-")?;
    let (guest_id, suffix) = rest.rsplit_once('-')?;
    if suffix.len() == 12 && suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(guest_id)
    } else {
        None
    }
}

#[derive(Debug)]
struct CacheEntry {
    resolved: ResolvedIp,
    at: Instant,
}

/// Priority-ordered IP resolver with a short-lived cache.
#[derive(Debug)]
pub struct IpResolver {
    connection: Arc<Connection>,
    metadata_path: Utf8PathBuf,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl IpResolver {
    /// Resolver bound to one hypervisor connection and metadata document.
    pub fn new(connection: Arc<Connection>, metadata_path: &Utf8Path, cache_ttl: Duration) -> Self {
        Self {
            connection,
            metadata_path: metadata_path.to_owned(),
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop all cached results. Called whenever the orchestrator performs
    /// a state transition that could change IP assignment.
    pub fn invalidate(&self) {
        self.cache.lock().expect("resolver cache poisoned").clear();
    }

    /// Resolve a cloned guest's IP, trying each method in priority order.
    /// The error of an exhausted resolution names every method's failure.
    pub fn resolve(&self, vm_name: &str) -> Result<ResolvedIp> {
        {
            let cache = self.cache.lock().expect("resolver cache poisoned");
            if let Some(entry) = cache.get(vm_name) {
                if entry.at.elapsed() < self.cache_ttl {
                    return Ok(entry.resolved.clone());
                }
            }
        }

        let mut failures: Vec<(ResolutionMethod, String)> = Vec::new();
        for method in ResolutionMethod::ALL {
            match self.try_method(method, vm_name) {
                Ok(ip) => {
                    let resolved = ResolvedIp {
                        ip,
                        confidence: method.confidence(),
                        method,
                    };
                    debug!(vm_name, method = method.as_str(), ip = %resolved.ip, "resolved");
                    self.cache.lock().expect("resolver cache poisoned").insert(
                        vm_name.to_string(),
                        CacheEntry {
                            resolved: resolved.clone(),
                            at: Instant::now(),
                        },
                    );
                    return Ok(resolved);
                }
                Err(reason) => failures.push((method, reason)),
            }
        }

        let detail = failures
            .iter()
            .map(|(method, reason)| format!("  {}: {}", method.as_str(), reason))
            .join("\n");
        Err(CyrisError::Network(format!(
            "could not discover an IP for {}; every method failed:\n{}",
            vm_name, detail
        ))
        .into())
    }

    fn try_method(
        &self,
        method: ResolutionMethod,
        vm_name: &str,
    ) -> std::result::Result<String, String> {
        match method {
            ResolutionMethod::TopologyMetadata => self.from_topology_metadata(vm_name),
            ResolutionMethod::HypervisorLease => self.from_domifaddr(vm_name, Some("lease")),
            ResolutionMethod::HypervisorCli => self.from_domifaddr(vm_name, None),
            ResolutionMethod::ArpScan => self.from_arp(vm_name),
            ResolutionMethod::DhcpLeases => self.from_dnsmasq(vm_name),
            ResolutionMethod::BridgeScan => self.from_bridges(vm_name),
        }
    }

    fn from_topology_metadata(&self, vm_name: &str) -> std::result::Result<String, String> {
        guest_id_from_vm_name(vm_name)
            .ok_or_else(|| format!("{:?} does not follow the cloned-guest naming", vm_name))?;
        let content = std::fs::read_to_string(self.metadata_path.as_std_path())
            .map_err(|e| format!("cannot read {}: {}", self.metadata_path, e))?;
        let document: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| format!("metadata not JSON: {}", e))?;
        lookup_assignment(&document, vm_name)
            .ok_or_else(|| format!("no ip_assignments entry for {}", vm_name))
    }

    fn from_domifaddr(
        &self,
        vm_name: &str,
        source: Option<&str>,
    ) -> std::result::Result<String, String> {
        let output = match source {
            Some(source) => self.connection.domain_if_addr(vm_name, source),
            None => {
                // Plain CLI query without a source argument
                let result = self
                    .connection
                    .virsh()
                    .args(["domifaddr", vm_name])
                    .output();
                match result {
                    Ok(output) if output.status.success() => {
                        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                    }
                    Ok(output) => Err(color_eyre::eyre::eyre!(
                        "{}",
                        String::from_utf8_lossy(&output.stderr).trim().to_string()
                    )),
                    Err(e) => Err(color_eyre::eyre::eyre!("{}", e)),
                }
            }
        };
        let text = output.map_err(|e| e.to_string())?;
        parse_domifaddr(&text).ok_or_else(|| "no ipv4 address in domifaddr output".to_string())
    }

    fn from_arp(&self, vm_name: &str) -> std::result::Result<String, String> {
        let macs = self.domain_macs(vm_name)?;
        let output = Command::new("ip")
            .args(["neigh", "show"])
            .output()
            .map_err(|e| format!("cannot run ip neigh: {}", e))?;
        let table = String::from_utf8_lossy(&output.stdout).into_owned();
        parse_neighbor_table(&table, &macs)
            .ok_or_else(|| "no ARP entry matches the domain MACs".to_string())
    }

    fn from_dnsmasq(&self, vm_name: &str) -> std::result::Result<String, String> {
        let macs = self.domain_macs(vm_name)?;
        for base in DNSMASQ_LEASE_PATHS {
            let path = std::path::Path::new(base);
            let files: Vec<std::path::PathBuf> = if path.is_dir() {
                std::fs::read_dir(path)
                    .map(|entries| {
                        entries
                            .flatten()
                            .map(|e| e.path())
                            .filter(|p| {
                                p.extension().map(|e| e == "leases").unwrap_or(false)
                                    || p.to_string_lossy().ends_with(".status")
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            } else if path.is_file() {
                vec![path.to_path_buf()]
            } else {
                continue;
            };
            for file in files {
                if let Ok(content) = std::fs::read_to_string(&file) {
                    if let Some(ip) = parse_dnsmasq_leases(&content, &macs) {
                        return Ok(ip);
                    }
                }
            }
        }
        Err("no dnsmasq lease matches the domain MACs".to_string())
    }

    fn from_bridges(&self, vm_name: &str) -> std::result::Result<String, String> {
        let macs = self.domain_macs(vm_name)?;
        let networks = self
            .connection
            .list_networks()
            .map_err(|e| format!("cannot list networks: {}", e))?;
        for network in networks.iter().filter(|n| n.starts_with("cr-br-")) {
            let output = Command::new("ip")
                .args(["neigh", "show", "dev", network])
                .output();
            if let Ok(output) = output {
                let table = String::from_utf8_lossy(&output.stdout).into_owned();
                if let Some(ip) = parse_neighbor_table(&table, &macs) {
                    return Ok(ip);
                }
            }
        }
        Err("no range bridge has a neighbor with the domain MACs".to_string())
    }

    fn domain_macs(&self, vm_name: &str) -> std::result::Result<Vec<String>, String> {
        let dom = self
            .connection
            .domain_xml(vm_name)
            .map_err(|e| format!("cannot read domain XML: {}", e))?;
        let mut nodes = Vec::new();
        dom.find_all("mac", &mut nodes);
        let macs: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.attr("address"))
            .map(|m| m.to_ascii_lowercase())
            .collect();
        if macs.is_empty() {
            return Err("domain XML lists no MAC addresses".to_string());
        }
        Ok(macs)
    }
}

/// Find an `ip_assignments` entry for a VM in the ranges metadata
/// document. Entries are keyed `<vm_name>.<iface>`; the first interface
/// wins.
pub fn lookup_assignment(document: &serde_json::Value, vm_name: &str) -> Option<String> {
    let prefix = format!("{}.", vm_name);
    let ranges = document.as_object()?;
    for range in ranges.values() {
        let assignments = range.get("tags")?.get("ip_assignments")?.as_object()?;
        let mut keys: Vec<&String> = assignments
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();
        if let Some(key) = keys.first() {
            if let Some(ip) = assignments[*key].as_str() {
                return Some(ip.to_string());
            }
        }
    }
    None
}

/// Pull the first IPv4 address out of `virsh domifaddr` output.
pub fn parse_domifaddr(output: &str) -> Option<String> {
    let re = Regex::new(r"ipv4\s+(\d+\.\d+\.\d+\.\d+)(?:/\d+)?").expect("static regex");
    re.captures(output)
        .map(|caps| caps.get(1).expect("group").as_str().to_string())
}

/// Match `ip neigh` output lines against a MAC set.
pub fn parse_neighbor_table(table: &str, macs: &[String]) -> Option<String> {
    for line in table.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = fields.first() else { continue };
        if !ip.contains('.') {
            continue; // ipv6 entry
        }
        if let Some(lladdr_pos) = fields.iter().position(|f| *f == "lladdr") {
            if let Some(mac) = fields.get(lladdr_pos + 1) {
                if macs.iter().any(|m| m == &mac.to_ascii_lowercase()) {
                    return Some((*ip).to_string());
                }
            }
        }
    }
    None
}

/// Match dnsmasq lease lines (`<expiry> <mac> <ip> <hostname> <clientid>`)
/// against a MAC set.
pub fn parse_dnsmasq_leases(content: &str, macs: &[String]) -> Option<String> {
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let mac = fields[1].to_ascii_lowercase();
        if macs.iter().any(|m| *m == mac) {
            return Some(fields[2].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_id_extraction() {
        assert_eq!(
            guest_id_from_vm_name("cyris-desktop-0011aabbccdd"),
            Some("desktop")
        );
        // Guest ids may themselves contain dashes
        assert_eq!(
            guest_id_from_vm_name("cyris-web-server-deadbeef0123"),
            Some("web-server")
        );
        assert_eq!(guest_id_from_vm_name("desktop-0011aabbccdd"), None);
        assert_eq!(guest_id_from_vm_name("cyris-desktop-xyz"), None);
        assert_eq!(guest_id_from_vm_name("cyris-desktop-0011aabbccd"), None);
    }

    #[test]
    fn test_method_priority_and_confidence() {
        // The declared order is the resolution priority
        let confidences: Vec<f32> = ResolutionMethod::ALL
            .iter()
            .map(|m| m.confidence())
            .collect();
        let mut sorted = confidences.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(confidences, sorted);
        assert_eq!(ResolutionMethod::TopologyMetadata.confidence(), 1.0);
        assert!(ResolutionMethod::HypervisorLease.confidence() >= 0.9);
    }

    #[test]
    fn test_parse_domifaddr() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:6c:3c:01    ipv4         192.168.122.100/24
";
        assert_eq!(
            parse_domifaddr(output).as_deref(),
            Some("192.168.122.100")
        );
        assert_eq!(parse_domifaddr("no table"), None);
    }

    #[test]
    fn test_parse_neighbor_table() {
        let table = "\
192.168.122.50 dev virbr0 lladdr 52:54:00:aa:bb:cc STALE
192.168.122.51 dev virbr0 lladdr 52:54:00:dd:ee:ff REACHABLE
fe80::1 dev virbr0 lladdr 52:54:00:dd:ee:ff router REACHABLE
";
        let macs = vec!["52:54:00:dd:ee:ff".to_string()];
        assert_eq!(
            parse_neighbor_table(table, &macs).as_deref(),
            Some("192.168.122.51")
        );
        let absent = vec!["52:54:00:00:00:00".to_string()];
        assert_eq!(parse_neighbor_table(table, &absent), None);
    }

    #[test]
    fn test_parse_dnsmasq_leases() {
        let leases = "\
1722500000 52:54:00:aa:bb:cc 192.168.123.2 cyris-desktop-aaa 01:52:54:00:aa:bb:cc
1722500001 52:54:00:dd:ee:ff 192.168.123.3 * *
";
        let macs = vec!["52:54:00:dd:ee:ff".to_string()];
        assert_eq!(
            parse_dnsmasq_leases(leases, &macs).as_deref(),
            Some("192.168.123.3")
        );
    }

    #[test]
    fn test_lookup_assignment() {
        let document = serde_json::json!({
            "train01": {
                "range_id": "train01",
                "tags": {
                    "ip_assignments": {
                        "cyris-desktop-0011aabbccdd.eth0": "192.168.10.2",
                        "cyris-desktop-0011aabbccdd.eth1": "192.168.20.2",
                        "cyris-web-deadbeef0123.eth0": "192.168.20.3"
                    }
                }
            }
        });
        assert_eq!(
            lookup_assignment(&document, "cyris-desktop-0011aabbccdd").as_deref(),
            Some("192.168.10.2")
        );
        assert_eq!(lookup_assignment(&document, "cyris-absent-000000000000"), None);
    }
}
