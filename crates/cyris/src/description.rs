//! Range description parsing and validation
//!
//! A range description is a YAML document with three top-level sections:
//! `host_settings`, `guest_settings` and `clone_settings`. Parsing is strict
//! by default: unknown keys are rejected with the offending field path
//! (`guest_settings[2].vcpus`). A legacy compatibility mode tolerates
//! unknown keys for descriptions written against older releases.

use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use camino::Utf8PathBuf;

use crate::errors::CyrisError;
use crate::tasks::{truthy, TaskEntry};

/// Allowed vCPU range for kvm-auto guests.
pub const VCPU_RANGE: (u32, u32) = (1, 32);
/// Allowed memory range in MiB for kvm-auto guests.
pub const MEMORY_RANGE: (u32, u32) = (256, 32768);

/// A physical (or virtual) host that runs guests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Host identifier referenced by clone settings
    pub id: String,
    /// Management address (`localhost` for the local machine)
    pub mgmt_addr: String,
    /// Address of the host's virtual bridge
    pub virbr_addr: String,
    /// Account used for SSH to the host
    pub account: String,
}

impl Host {
    /// Whether the host is the local machine rather than a remote target.
    pub fn is_local(&self) -> bool {
        matches!(self.mgmt_addr.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Graphics backend selection for kvm-auto guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsKind {
    /// VNC display
    Vnc,
    /// SPICE display
    Spice,
    /// Local SDL window
    Sdl,
    /// Headless
    None,
}

impl GraphicsKind {
    /// The value virt-install expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicsKind::Vnc => "vnc",
            GraphicsKind::Spice => "spice",
            GraphicsKind::Sdl => "sdl",
            GraphicsKind::None => "none",
        }
    }
}

/// NIC model selection for kvm-auto guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkModel {
    /// Paravirtualized virtio-net
    Virtio,
    /// Intel e1000 emulation
    E1000,
    /// Realtek rtl8139 emulation
    Rtl8139,
    /// NE2000 PCI emulation
    Ne2kPci,
}

impl NetworkModel {
    /// The value virt-install expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkModel::Virtio => "virtio",
            NetworkModel::E1000 => "e1000",
            NetworkModel::Rtl8139 => "rtl8139",
            NetworkModel::Ne2kPci => "ne2k_pci",
        }
    }
}

/// Optional virt-install tuning knobs for kvm-auto guests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallOverrides {
    /// Graphics backend (headless when unset)
    pub graphics: Option<GraphicsKind>,
    /// Fixed display port
    pub graphics_port: Option<u16>,
    /// Display listen address
    pub graphics_listen: Option<String>,
    /// NIC model for every interface
    pub network_model: Option<NetworkModel>,
    /// osinfo variant (derived from the OS type when unset)
    pub os_variant: Option<String>,
    /// CPU model instead of host passthrough
    pub cpu_model: Option<String>,
    /// Console target type
    pub console_type: Option<String>,
    /// `--boot` options, joined with commas
    #[serde(default)]
    pub boot_options: Vec<String>,
    /// Free-form arguments appended verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Base VM provisioning source, discriminated by `basevm_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "basevm_type")]
pub enum BaseVm {
    /// Classic path: clone from an existing libvirt XML + disk.
    #[serde(rename = "kvm")]
    Kvm {
        /// Path to the existing libvirt domain XML to clone
        basevm_config_file: Utf8PathBuf,
        /// Host where the base VM's disk/config lives
        basevm_host: String,
        /// OS type of the base VM
        basevm_os_type: String,
    },
    /// Automatic path: build the base image, then import with virt-install.
    #[serde(rename = "kvm-auto")]
    KvmAuto {
        /// Name for the built base image
        image_name: String,
        /// Number of vCPUs for the base VM
        vcpus: u32,
        /// Memory (MB) for the base VM
        memory: u32,
        /// Disk size for the base VM
        disk_size: String,
        #[serde(flatten)]
        /// Installer overrides
        install: InstallOverrides,
    },
    /// Cloud path; accepted by the parser, provisioned by a separate adapter.
    #[serde(rename = "aws")]
    Aws {
        /// AMI identifier to launch
        ami_id: String,
        /// EC2 instance type
        instance_type: String,
    },
}

/// A guest template from `guest_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    /// Guest identifier referenced by clone settings
    pub id: String,
    /// Provisioning source
    #[serde(flatten)]
    pub base: BaseVm,
    /// Ordered training-content tasks
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl Guest {
    /// The guest OS type, declared for `kvm` and derived from the image
    /// name for `kvm-auto`.
    pub fn os_type(&self) -> Result<String> {
        match &self.base {
            BaseVm::Kvm { basevm_os_type, .. } => Ok(basevm_os_type.clone()),
            BaseVm::KvmAuto { image_name, .. } => {
                derive_os_type(image_name).map(|s| s.to_string())
            }
            BaseVm::Aws { .. } => Ok("aws".to_string()),
        }
    }
}

/// Case-insensitive `image_name` prefix to OS type table.
const OS_TYPE_PREFIXES: &[(&str, &str)] = &[
    ("ubuntu-20.04", "ubuntu_20"),
    ("ubuntu-22.04", "ubuntu_22"),
    ("ubuntu-24.04", "ubuntu_24"),
    ("debian-11", "debian_11"),
    ("debian-12", "debian_12"),
    ("centosstream-9", "centos_9"),
    ("fedora-", "fedora"),
    ("windows-", "windows"),
];

/// Derive the guest OS type from a builder image name.
pub fn derive_os_type(image_name: &str) -> Result<&'static str> {
    let lower = image_name.to_ascii_lowercase();
    OS_TYPE_PREFIXES
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|(_, os)| *os)
        .ok_or_else(|| {
            CyrisError::Config(format!(
                "image_name {:?} has no known OS type prefix",
                image_name
            ))
            .into()
        })
}

/// Reference to one interface of a cloned guest, e.g. `desktop.eth0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemberRef {
    /// The member guest's id
    pub guest_id: String,
    /// Interface name inside the guest
    pub iface: String,
}

impl TryFrom<String> for MemberRef {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let (guest_id, iface) = value
            .split_once('.')
            .ok_or_else(|| format!("member {:?} is not of the form guest_id.iface", value))?;
        if guest_id.is_empty() || iface.is_empty() {
            return Err(format!("member {:?} is not of the form guest_id.iface", value));
        }
        Ok(Self {
            guest_id: guest_id.to_string(),
            iface: iface.to_string(),
        })
    }
}

impl From<MemberRef> for String {
    fn from(m: MemberRef) -> String {
        format!("{}.{}", m.guest_id, m.iface)
    }
}

/// A declared range-local network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Declared network name
    pub name: String,
    /// CIDR; allocated from the free pool when unset
    pub subnet: Option<String>,
    /// Interfaces attached to this network
    pub members: Vec<MemberRef>,
}

/// One `rule: "src=... dst=... [sport=...] [dport=...]"` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// The raw rule string
    pub rule: String,
}

/// A parsed forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Source network name
    pub src_network: String,
    /// Destination network name
    pub dst_network: String,
    /// Optional source port constraint
    pub sport: Option<String>,
    /// Optional destination port constraint
    pub dport: Option<String>,
    /// Protocol, `tcp` unless stated
    pub protocol: String,
}

impl ForwardingRule {
    /// Parse the legacy `key=value` rule grammar.
    pub fn parse(rule: &str) -> Result<Self> {
        let mut src = None;
        let mut dst = None;
        let mut sport = None;
        let mut dport = None;
        let mut protocol = "tcp".to_string();

        for token in rule.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                CyrisError::Config(format!("forwarding rule token {:?} is not key=value", token))
            })?;
            match key {
                "src" => src = Some(value.to_string()),
                "dst" => dst = Some(value.to_string()),
                "sport" => sport = Some(value.to_string()),
                "dport" => dport = Some(value.to_string()),
                "proto" | "protocol" => protocol = value.to_string(),
                other => {
                    return Err(CyrisError::Config(format!(
                        "forwarding rule has unknown key {:?}",
                        other
                    ))
                    .into())
                }
            }
        }

        let src_network = src.ok_or_else(|| {
            CyrisError::Config(format!("forwarding rule {:?} is missing src=", rule))
        })?;
        let dst_network = dst.ok_or_else(|| {
            CyrisError::Config(format!("forwarding rule {:?} is missing dst=", rule))
        })?;

        Ok(Self {
            src_network,
            dst_network,
            sport,
            dport,
            protocol,
        })
    }
}

/// One topology block inside a clone host entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySpec {
    /// Topology type (only `custom` is meaningful today)
    #[serde(rename = "type", default = "default_topology_type")]
    pub kind: String,
    /// Declared networks
    pub networks: Vec<NetworkSpec>,
    /// Layer-3 policy between the networks
    #[serde(default)]
    pub forwarding_rules: Vec<RuleSpec>,
}

fn default_topology_type() -> String {
    "custom".to_string()
}

impl TopologySpec {
    /// Parse all rule strings, failing on the first malformed one.
    pub fn parsed_rules(&self) -> Result<Vec<ForwardingRule>> {
        self.forwarding_rules
            .iter()
            .map(|r| ForwardingRule::parse(&r.rule))
            .collect()
    }
}

/// Multiplicity of one guest template on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneGuest {
    /// Guest template to clone
    pub guest_id: String,
    /// Instances per host entry
    #[serde(default = "default_one")]
    pub number: u32,
    /// Whether this guest is exposed for external access
    #[serde(default, deserialize_with = "truthy")]
    pub entry_point: bool,
}

fn default_one() -> u32 {
    1
}

/// Per-host clone plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneHost {
    /// Host the clones land on
    pub host_id: String,
    /// Copies of the whole guest set
    #[serde(default = "default_one")]
    pub instance_number: u32,
    /// Guest multiplicities
    pub guests: Vec<CloneGuest>,
    /// Range-local networks and rules
    #[serde(default)]
    pub topology: Vec<TopologySpec>,
}

/// A clone_settings entry: one range to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneSetting {
    /// User-supplied range identifier
    #[serde(deserialize_with = "stringly")]
    pub range_id: String,
    /// Per-host clone plans
    pub hosts: Vec<CloneHost>,
}

/// The whole parsed description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDescription {
    /// Physical/virtual hosts
    pub host_settings: Vec<Host>,
    /// Guest templates
    pub guest_settings: Vec<Guest>,
    /// Ranges to instantiate
    pub clone_settings: Vec<CloneSetting>,
}

impl RangeDescription {
    /// Look up a host by id.
    pub fn host(&self, id: &str) -> Option<&Host> {
        self.host_settings.iter().find(|h| h.id == id)
    }

    /// Look up a guest template by id.
    pub fn guest(&self, id: &str) -> Option<&Guest> {
        self.guest_settings.iter().find(|g| g.id == id)
    }
}

/// Accept either a string or a number for user-supplied identifiers.
fn stringly<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string identifier, got {:?}",
            other
        ))),
    }
}

/// Parse a YAML range description.
pub fn parse_description(yaml: &str, legacy_compat: bool) -> Result<RangeDescription> {
    let value: Value =
        serde_yaml::from_str(yaml).context("Range description is not valid YAML")?;
    if !legacy_compat {
        schema::check(&value)?;
    }
    let description: RangeDescription = serde_yaml::from_value(value)
        .map_err(|e| CyrisError::Config(format!("range description: {}", e)))?;
    validate(&description)?;
    Ok(description)
}

/// Semantic validation: resource bounds, per-type invariants and
/// cross-references between sections.
pub fn validate(description: &RangeDescription) -> Result<()> {
    for (i, guest) in description.guest_settings.iter().enumerate() {
        if let BaseVm::KvmAuto {
            vcpus,
            memory,
            disk_size,
            ..
        } = &guest.base
        {
            if *vcpus < VCPU_RANGE.0 || *vcpus > VCPU_RANGE.1 {
                return Err(config_err(format!(
                    "guest_settings[{}].vcpus: {} is outside [{}, {}]",
                    i, vcpus, VCPU_RANGE.0, VCPU_RANGE.1
                )));
            }
            if *memory < MEMORY_RANGE.0 || *memory > MEMORY_RANGE.1 {
                return Err(config_err(format!(
                    "guest_settings[{}].memory: {} is outside [{}, {}]",
                    i, memory, MEMORY_RANGE.0, MEMORY_RANGE.1
                )));
            }
            if !disk_size_valid(disk_size) {
                return Err(config_err(format!(
                    "guest_settings[{}].disk_size: {:?} is not of the form <number>G or <number>M",
                    i, disk_size
                )));
            }
            // os type must be derivable before any long-running step
            guest.os_type()?;
        }
    }

    for (ci, clone) in description.clone_settings.iter().enumerate() {
        if clone.range_id.is_empty() {
            return Err(config_err(format!(
                "clone_settings[{}].range_id must not be empty",
                ci
            )));
        }
        for (hi, host) in clone.hosts.iter().enumerate() {
            if description.host(&host.host_id).is_none() {
                return Err(config_err(format!(
                    "clone_settings[{}].hosts[{}].host_id: unknown host {:?}",
                    ci, hi, host.host_id
                )));
            }
            for (gi, guest) in host.guests.iter().enumerate() {
                if description.guest(&guest.guest_id).is_none() {
                    return Err(config_err(format!(
                        "clone_settings[{}].hosts[{}].guests[{}].guest_id: unknown guest {:?}",
                        ci, hi, gi, guest.guest_id
                    )));
                }
                if guest.number == 0 {
                    return Err(config_err(format!(
                        "clone_settings[{}].hosts[{}].guests[{}].number must be at least 1",
                        ci, hi, gi
                    )));
                }
            }
            for (ti, topo) in host.topology.iter().enumerate() {
                for (ni, network) in topo.networks.iter().enumerate() {
                    for member in &network.members {
                        if host.guests.iter().all(|g| g.guest_id != member.guest_id) {
                            return Err(config_err(format!(
                                "clone_settings[{}].hosts[{}].topology[{}].networks[{}]: \
                                 member {:?} references a guest not cloned on this host",
                                ci, hi, ti, ni, member.guest_id
                            )));
                        }
                    }
                }
                let rules = topo.parsed_rules()?;
                for rule in &rules {
                    for name in [&rule.src_network, &rule.dst_network] {
                        if topo.networks.iter().all(|n| &n.name != name) {
                            return Err(config_err(format!(
                                "clone_settings[{}].hosts[{}].topology[{}]: \
                                 forwarding rule references unknown network {:?}",
                                ci, hi, ti, name
                            )));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn config_err(message: String) -> color_eyre::Report {
    CyrisError::Config(message).into()
}

fn disk_size_valid(disk_size: &str) -> bool {
    let Some(unit) = disk_size.chars().last() else {
        return false;
    };
    if unit != 'G' && unit != 'M' {
        return false;
    }
    let digits = &disk_size[..disk_size.len() - 1];
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Strict unknown-key checking with field paths.
mod schema {
    use super::*;

    const TOP: &[&str] = &["host_settings", "guest_settings", "clone_settings"];
    const HOST: &[&str] = &["id", "mgmt_addr", "virbr_addr", "account"];
    const GUEST_COMMON: &[&str] = &["id", "basevm_type", "tasks"];
    const GUEST_KVM: &[&str] = &["basevm_config_file", "basevm_host", "basevm_os_type"];
    const GUEST_KVM_AUTO: &[&str] = &[
        "image_name",
        "vcpus",
        "memory",
        "disk_size",
        "graphics",
        "graphics_port",
        "graphics_listen",
        "network_model",
        "os_variant",
        "cpu_model",
        "console_type",
        "boot_options",
        "extra_args",
    ];
    const GUEST_AWS: &[&str] = &["ami_id", "instance_type"];
    const CLONE: &[&str] = &["range_id", "hosts"];
    const CLONE_HOST: &[&str] = &["host_id", "instance_number", "guests", "topology"];
    const CLONE_GUEST: &[&str] = &["guest_id", "number", "entry_point"];
    const TOPOLOGY: &[&str] = &["type", "networks", "forwarding_rules"];
    const NETWORK: &[&str] = &["name", "subnet", "members"];
    const RULE: &[&str] = &["rule"];

    const TASK_KINDS: &[&str] = &[
        "add_account",
        "modify_account",
        "install_package",
        "copy_content",
        "execute_program",
        "emulate_attack",
        "emulate_malware",
        "emulate_traffic_capture_file",
        "firewall_rules",
    ];

    pub fn check(value: &Value) -> Result<()> {
        let root = as_mapping(value, "")?;
        check_keys(root, TOP, "")?;

        if let Some(hosts) = root.get("host_settings") {
            for (i, host) in as_sequence(hosts, "host_settings")?.iter().enumerate() {
                let path = format!("host_settings[{}]", i);
                check_keys(as_mapping(host, &path)?, HOST, &path)?;
            }
        }

        if let Some(guests) = root.get("guest_settings") {
            for (i, guest) in as_sequence(guests, "guest_settings")?.iter().enumerate() {
                let path = format!("guest_settings[{}]", i);
                check_guest(as_mapping(guest, &path)?, &path)?;
            }
        }

        if let Some(clones) = root.get("clone_settings") {
            for (i, clone) in as_sequence(clones, "clone_settings")?.iter().enumerate() {
                let path = format!("clone_settings[{}]", i);
                check_clone(as_mapping(clone, &path)?, &path)?;
            }
        }

        Ok(())
    }

    fn check_guest(map: &serde_yaml::Mapping, path: &str) -> Result<()> {
        let basevm_type = map
            .get("basevm_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let (allowed, required): (Vec<&str>, &[&str]) = match basevm_type {
            "kvm" => (
                [GUEST_COMMON, GUEST_KVM].concat(),
                &["basevm_config_file", "basevm_host", "basevm_os_type"],
            ),
            "kvm-auto" => (
                [GUEST_COMMON, GUEST_KVM_AUTO].concat(),
                &["image_name", "vcpus", "memory", "disk_size"],
            ),
            "aws" => ([GUEST_COMMON, GUEST_AWS].concat(), &["ami_id"]),
            other => {
                return Err(config_err(format!(
                    "{}.basevm_type: expected kvm, kvm-auto or aws, got {:?}",
                    path, other
                )))
            }
        };

        // kvm-auto forbids the classic config file; the inverse requiredness
        // is covered by the `required` list.
        if basevm_type == "kvm-auto" && map.contains_key("basevm_config_file") {
            return Err(config_err(format!(
                "{}.basevm_config_file is not allowed for basevm_type kvm-auto",
                path
            )));
        }

        check_keys(map, &allowed, path)?;
        for key in required {
            if !map.contains_key(*key) {
                return Err(config_err(format!(
                    "{}.{} is required for basevm_type {}",
                    path, key, basevm_type
                )));
            }
        }

        if let Some(tasks) = map.get("tasks") {
            let tasks_path = format!("{}.tasks", path);
            for (i, task) in as_sequence(tasks, &tasks_path)?.iter().enumerate() {
                let task_path = format!("{}[{}]", tasks_path, i);
                let task_map = as_mapping(task, &task_path)?;
                check_keys(task_map, TASK_KINDS, &task_path)?;
                if task_map.len() != 1 {
                    return Err(config_err(format!(
                        "{}: each task entry must contain exactly one task kind",
                        task_path
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_clone(map: &serde_yaml::Mapping, path: &str) -> Result<()> {
        check_keys(map, CLONE, path)?;
        let Some(hosts) = map.get("hosts") else {
            return Ok(());
        };
        for (hi, host) in as_sequence(hosts, &format!("{}.hosts", path))?.iter().enumerate() {
            let host_path = format!("{}.hosts[{}]", path, hi);
            let host_map = as_mapping(host, &host_path)?;
            check_keys(host_map, CLONE_HOST, &host_path)?;

            if let Some(guests) = host_map.get("guests") {
                for (gi, guest) in as_sequence(guests, &format!("{}.guests", host_path))?
                    .iter()
                    .enumerate()
                {
                    let guest_path = format!("{}.guests[{}]", host_path, gi);
                    check_keys(as_mapping(guest, &guest_path)?, CLONE_GUEST, &guest_path)?;
                }
            }

            if let Some(topologies) = host_map.get("topology") {
                for (ti, topo) in as_sequence(topologies, &format!("{}.topology", host_path))?
                    .iter()
                    .enumerate()
                {
                    let topo_path = format!("{}.topology[{}]", host_path, ti);
                    let topo_map = as_mapping(topo, &topo_path)?;
                    check_keys(topo_map, TOPOLOGY, &topo_path)?;

                    if let Some(networks) = topo_map.get("networks") {
                        for (ni, network) in
                            as_sequence(networks, &format!("{}.networks", topo_path))?
                                .iter()
                                .enumerate()
                        {
                            let net_path = format!("{}.networks[{}]", topo_path, ni);
                            check_keys(as_mapping(network, &net_path)?, NETWORK, &net_path)?;
                        }
                    }
                    if let Some(rules) = topo_map.get("forwarding_rules") {
                        for (ri, rule) in
                            as_sequence(rules, &format!("{}.forwarding_rules", topo_path))?
                                .iter()
                                .enumerate()
                        {
                            let rule_path = format!("{}.forwarding_rules[{}]", topo_path, ri);
                            check_keys(as_mapping(rule, &rule_path)?, RULE, &rule_path)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_keys(map: &serde_yaml::Mapping, allowed: &[&str], path: &str) -> Result<()> {
        for key in map.keys() {
            let name = key.as_str().unwrap_or_default();
            if !allowed.contains(&name) {
                let shown = if path.is_empty() {
                    name.to_string()
                } else {
                    format!("{}.{}", path, name)
                };
                return Err(config_err(format!("unknown key: {}", shown)));
            }
        }
        Ok(())
    }

    fn as_mapping<'a>(value: &'a Value, path: &str) -> Result<&'a serde_yaml::Mapping> {
        value.as_mapping().ok_or_else(|| {
            config_err(format!(
                "{}: expected a mapping",
                if path.is_empty() { "document" } else { path }
            ))
        })
    }

    fn as_sequence<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>> {
        match value {
            Value::Sequence(seq) => Ok(seq),
            _ => Err(config_err(format!("{}: expected a list", path))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
host_settings:
  - id: host_1
    mgmt_addr: localhost
    virbr_addr: 192.168.122.1
    account: ubuntu

guest_settings:
  - id: desktop
    basevm_type: kvm-auto
    image_name: ubuntu-20.04
    vcpus: 2
    memory: 2048
    disk_size: 20G
    tasks:
      - add_account: [{ account: trainee, passwd: t123 }]

clone_settings:
  - range_id: basic
    hosts:
      - host_id: host_1
        instance_number: 1
        guests: [{ guest_id: desktop, number: 1, entry_point: yes }]
        topology:
          - type: custom
            networks:
              - name: office
                members: [desktop.eth0]
            forwarding_rules:
              - { rule: "src=office dst=office dport=22" }
"#;

    #[test]
    fn test_parse_minimal() {
        let description = parse_description(MINIMAL, false).unwrap();
        assert_eq!(description.host_settings.len(), 1);
        assert_eq!(description.guest_settings.len(), 1);
        assert_eq!(description.clone_settings.len(), 1);

        let guest = &description.guest_settings[0];
        assert_eq!(guest.id, "desktop");
        match &guest.base {
            BaseVm::KvmAuto {
                image_name,
                vcpus,
                memory,
                disk_size,
                ..
            } => {
                assert_eq!(image_name, "ubuntu-20.04");
                assert_eq!(*vcpus, 2);
                assert_eq!(*memory, 2048);
                assert_eq!(disk_size, "20G");
            }
            other => panic!("unexpected base vm: {:?}", other),
        }
        assert_eq!(guest.os_type().unwrap(), "ubuntu_20");
        assert_eq!(guest.tasks.len(), 1);

        let clone = &description.clone_settings[0];
        assert_eq!(clone.range_id, "basic");
        // `entry_point: yes` must parse as true under YAML 1.2 rules
        assert!(clone.hosts[0].guests[0].entry_point);

        let members = &clone.hosts[0].topology[0].networks[0].members;
        assert_eq!(members[0].guest_id, "desktop");
        assert_eq!(members[0].iface, "eth0");
    }

    #[test]
    fn test_unknown_key_named_with_path() {
        let yaml = MINIMAL.replace("disk_size: 20G", "disk_size: 20G\n    disc_size: 30G");
        let err = parse_description(&yaml, false).unwrap_err();
        assert!(err.to_string().contains("guest_settings[0].disc_size"), "{err}");

        // Legacy compatibility mode tolerates the same key
        assert!(parse_description(&yaml, true).is_ok());
    }

    #[test]
    fn test_vcpus_out_of_range() {
        let yaml = MINIMAL.replace("vcpus: 2", "vcpus: 64");
        let err = parse_description(&yaml, false).unwrap_err();
        assert!(err.to_string().contains("guest_settings[0].vcpus"), "{err}");
    }

    #[test]
    fn test_memory_out_of_range() {
        let yaml = MINIMAL.replace("memory: 2048", "memory: 128");
        let err = parse_description(&yaml, false).unwrap_err();
        assert!(err.to_string().contains("guest_settings[0].memory"), "{err}");
    }

    #[test]
    fn test_kvm_auto_forbids_config_file() {
        let yaml = MINIMAL.replace(
            "image_name: ubuntu-20.04",
            "image_name: ubuntu-20.04\n    basevm_config_file: /tmp/base.xml",
        );
        let err = parse_description(&yaml, false).unwrap_err();
        assert!(err.to_string().contains("basevm_config_file"), "{err}");
    }

    #[test]
    fn test_kvm_requires_config_file() {
        let yaml = r#"
host_settings:
  - id: host_1
    mgmt_addr: localhost
    virbr_addr: 192.168.122.1
    account: ubuntu
guest_settings:
  - id: legacy
    basevm_type: kvm
    basevm_host: host_1
    basevm_os_type: ubuntu_20
clone_settings: []
"#;
        let err = parse_description(yaml, false).unwrap_err();
        assert!(err.to_string().contains("basevm_config_file"), "{err}");
    }

    #[test]
    fn test_unknown_guest_reference() {
        let yaml = MINIMAL.replace("guest_id: desktop", "guest_id: server");
        let err = parse_description(&yaml, false).unwrap_err();
        assert!(err.to_string().contains("unknown guest"), "{err}");
    }

    #[test]
    fn test_derive_os_type() {
        assert_eq!(derive_os_type("ubuntu-20.04").unwrap(), "ubuntu_20");
        assert_eq!(derive_os_type("Ubuntu-22.04-server").unwrap(), "ubuntu_22");
        assert_eq!(derive_os_type("debian-12-genericcloud").unwrap(), "debian_12");
        assert_eq!(derive_os_type("fedora-40").unwrap(), "fedora");
        assert!(derive_os_type("slackware-15").is_err());
    }

    #[test]
    fn test_forwarding_rule_parse() {
        let rule = ForwardingRule::parse("src=office dst=dmz dport=80").unwrap();
        assert_eq!(rule.src_network, "office");
        assert_eq!(rule.dst_network, "dmz");
        assert_eq!(rule.dport.as_deref(), Some("80"));
        assert_eq!(rule.sport, None);
        assert_eq!(rule.protocol, "tcp");

        let rule = ForwardingRule::parse("src=a dst=b sport=1024 proto=udp").unwrap();
        assert_eq!(rule.sport.as_deref(), Some("1024"));
        assert_eq!(rule.protocol, "udp");

        assert!(ForwardingRule::parse("dst=b").is_err());
        assert!(ForwardingRule::parse("src=a dst=b nonsense=1").is_err());
    }

    #[test]
    fn test_disk_size_shapes() {
        assert!(disk_size_valid("20G"));
        assert!(disk_size_valid("512M"));
        assert!(!disk_size_valid("20"));
        assert!(!disk_size_valid("G"));
        assert!(!disk_size_valid("20GB"));
    }

    #[test]
    fn test_numeric_range_id() {
        let yaml = MINIMAL.replace("range_id: basic", "range_id: 125");
        let description = parse_description(&yaml, false).unwrap();
        assert_eq!(description.clone_settings[0].range_id, "125");
    }

    #[test]
    fn test_member_ref_parse() {
        let member = MemberRef::try_from("desktop.eth0".to_string()).unwrap();
        assert_eq!(member.guest_id, "desktop");
        assert_eq!(member.iface, "eth0");
        assert!(MemberRef::try_from("desktop".to_string()).is_err());
    }
}
