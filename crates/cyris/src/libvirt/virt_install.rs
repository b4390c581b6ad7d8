//! virt-install command synthesis for the kvm-auto import path
//!
//! kvm-auto guests boot prebuilt images, so the installer always runs in
//! `--import` mode with no installer ISO and never attaches a console
//! (`--noautoconsole`). Flag ordering is deterministic so two runs over
//! the same guest produce byte-identical command lines in the ledger.

use crate::description::InstallOverrides;

/// Inputs for one virt-install invocation.
#[derive(Debug, Clone)]
pub struct VirtInstallSpec {
    /// Hypervisor connection URI
    pub uri: String,
    /// Domain name
    pub name: String,
    /// Memory in MiB
    pub memory_mib: u32,
    /// vCPU count
    pub vcpus: u32,
    /// Overlay disk the guest boots from
    pub disk: String,
    /// Optional cloud-init seed ISO
    pub seed_iso: Option<String>,
    /// libvirt network names, one NIC each, in declaration order
    pub networks: Vec<String>,
    /// Guest OS type (for the os-variant default)
    pub os_type: String,
    /// Per-guest virt-install tuning
    pub overrides: InstallOverrides,
}

/// Map a derived OS type to the osinfo variant virt-install expects.
pub fn default_os_variant(os_type: &str) -> &'static str {
    match os_type {
        "ubuntu_20" => "ubuntu20.04",
        "ubuntu_22" => "ubuntu22.04",
        "ubuntu_24" => "ubuntu24.04",
        "debian_11" => "debian11",
        "debian_12" => "debian12",
        "centos_9" => "centos-stream9",
        "fedora" => "fedora-unknown",
        "windows" => "win10",
        _ => "generic",
    }
}

/// Synthesize the full argument vector (without the binary name).
pub fn synthesize(spec: &VirtInstallSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push("--connect".into());
    args.push(spec.uri.clone());
    args.push("--name".into());
    args.push(spec.name.clone());
    args.push("--memory".into());
    args.push(spec.memory_mib.to_string());
    args.push("--vcpus".into());
    args.push(spec.vcpus.to_string());

    args.push("--disk".into());
    args.push(format!("path={},format=qcow2,bus=virtio", spec.disk));
    if let Some(ref iso) = spec.seed_iso {
        args.push("--disk".into());
        args.push(format!("path={},device=cdrom", iso));
    }

    let model = spec
        .overrides
        .network_model
        .map(|m| m.as_str())
        .unwrap_or("virtio");
    for network in &spec.networks {
        args.push("--network".into());
        args.push(format!("network={},model={}", network, model));
    }

    args.push("--graphics".into());
    match spec.overrides.graphics {
        Some(kind) => {
            let mut value = kind.as_str().to_string();
            if kind != crate::description::GraphicsKind::None {
                if let Some(port) = spec.overrides.graphics_port {
                    value.push_str(&format!(",port={}", port));
                }
                if let Some(ref listen) = spec.overrides.graphics_listen {
                    value.push_str(&format!(",listen={}", listen));
                }
            }
            args.push(value);
        }
        None => args.push("none".into()),
    }

    args.push("--os-variant".into());
    match spec.overrides.os_variant {
        Some(ref variant) => args.push(variant.clone()),
        None => args.push(default_os_variant(&spec.os_type).to_string()),
    }

    if let Some(ref cpu) = spec.overrides.cpu_model {
        args.push("--cpu".into());
        args.push(cpu.clone());
    }
    if let Some(ref console) = spec.overrides.console_type {
        args.push("--console".into());
        args.push(format!("pty,target_type={}", console));
    }
    if !spec.overrides.boot_options.is_empty() {
        args.push("--boot".into());
        args.push(spec.overrides.boot_options.join(","));
    }

    args.push("--import".into());
    args.push("--noautoconsole".into());

    for extra in &spec.overrides.extra_args {
        args.push(extra.clone());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{GraphicsKind, NetworkModel};

    fn base_spec() -> VirtInstallSpec {
        VirtInstallSpec {
            uri: "qemu:///system".to_string(),
            name: "cyris-desktop-0011aabbccdd".to_string(),
            memory_mib: 2048,
            vcpus: 2,
            disk: "/srv/cyber_range/r1/disks/d.qcow2".to_string(),
            seed_iso: Some("/srv/cyber_range/r1/cloud-init.iso".to_string()),
            networks: vec!["cr-br-r1-office".to_string()],
            os_type: "ubuntu_20".to_string(),
            overrides: InstallOverrides::default(),
        }
    }

    #[test]
    fn test_deterministic_order_and_import_mode() {
        let args = synthesize(&base_spec());
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "--connect qemu:///system --name cyris-desktop-0011aabbccdd \
             --memory 2048 --vcpus 2 \
             --disk path=/srv/cyber_range/r1/disks/d.qcow2,format=qcow2,bus=virtio \
             --disk path=/srv/cyber_range/r1/cloud-init.iso,device=cdrom \
             --network network=cr-br-r1-office,model=virtio \
             --graphics none --os-variant ubuntu20.04 --import --noautoconsole"
        );
        // Two invocations over the same spec are byte-identical
        assert_eq!(args, synthesize(&base_spec()));
    }

    #[test]
    fn test_graphics_with_port_and_listen() {
        let mut spec = base_spec();
        spec.overrides.graphics = Some(GraphicsKind::Vnc);
        spec.overrides.graphics_port = Some(5901);
        spec.overrides.graphics_listen = Some("0.0.0.0".to_string());
        let args = synthesize(&spec);
        let g = args.iter().position(|a| a == "--graphics").unwrap();
        assert_eq!(args[g + 1], "vnc,port=5901,listen=0.0.0.0");
    }

    #[test]
    fn test_network_model_override() {
        let mut spec = base_spec();
        spec.overrides.network_model = Some(NetworkModel::E1000);
        spec.networks.push("cr-br-r1-dmz".to_string());
        let args = synthesize(&spec);
        let networks: Vec<_> = args
            .iter()
            .filter(|a| a.starts_with("network="))
            .collect();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0], "network=cr-br-r1-office,model=e1000");
        assert_eq!(networks[1], "network=cr-br-r1-dmz,model=e1000");
    }

    #[test]
    fn test_boot_cpu_console_and_extra_args() {
        let mut spec = base_spec();
        spec.overrides.cpu_model = Some("Skylake-Client".to_string());
        spec.overrides.console_type = Some("serial".to_string());
        spec.overrides.boot_options = vec!["uefi".to_string(), "menu=on".to_string()];
        spec.overrides.extra_args = vec!["--autostart".to_string()];
        let args = synthesize(&spec);
        let joined = args.join(" ");
        assert!(joined.contains("--cpu Skylake-Client"));
        assert!(joined.contains("--console pty,target_type=serial"));
        assert!(joined.contains("--boot uefi,menu=on"));
        // extra args land after the fixed tail
        assert_eq!(args.last().unwrap(), "--autostart");
        let import = args.iter().position(|a| a == "--import").unwrap();
        let noauto = args.iter().position(|a| a == "--noautoconsole").unwrap();
        assert!(import < noauto);
        assert!(noauto < args.len() - 1);
    }

    #[test]
    fn test_os_variant_default_mapping() {
        assert_eq!(default_os_variant("ubuntu_20"), "ubuntu20.04");
        assert_eq!(default_os_variant("debian_12"), "debian12");
        assert_eq!(default_os_variant("centos_9"), "centos-stream9");
        assert_eq!(default_os_variant("something_else"), "generic");
    }
}
