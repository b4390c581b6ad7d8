//! validate command - environment readiness checks

use clap::Parser;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use std::process::Command;

use crate::config::Config;
use crate::errors::CyrisError;

/// Options for the validate command
#[derive(Debug, Parser)]
pub struct ValidateOpts {
    /// Skip probing the hypervisor connection
    #[clap(long)]
    pub skip_libvirt: bool,
}

/// One readiness check result.
#[derive(Debug)]
pub struct CheckResult {
    /// What was checked
    pub name: &'static str,
    /// Whether the check passed
    pub ok: bool,
    /// Whether a failure blocks range creation
    pub required: bool,
    /// Remediation hint
    pub hint: &'static str,
    /// Observed value or failure detail
    pub detail: String,
}

/// Required and optional external tools, with install hints.
const TOOL_CHECKS: &[(&str, bool, &str)] = &[
    ("virsh", true, "install libvirt-clients"),
    ("qemu-img", true, "install qemu-utils"),
    ("virt-builder", true, "install libguestfs-tools"),
    ("virt-customize", true, "install libguestfs-tools"),
    ("virt-install", true, "install virtinst"),
    ("genisoimage", true, "install genisoimage"),
    ("ssh", true, "install openssh-client"),
    ("scp", true, "install openssh-client"),
    ("sshpass", false, "install sshpass for password auth"),
    ("iptables", true, "install iptables"),
    ("setsid", true, "part of util-linux"),
    ("parallel-ssh", false, "install pssh to offload parallel SSH"),
    ("tcpreplay", false, "install tcpreplay for traffic emulation"),
];

/// Run every check and collect results.
pub fn collect(config: &Config, probe_libvirt: bool) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for &(tool, required, hint) in TOOL_CHECKS {
        let found = Command::new("which")
            .arg(tool)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        results.push(CheckResult {
            name: tool,
            ok: found,
            required,
            hint,
            detail: if found { "found".to_string() } else { "missing".to_string() },
        });
    }

    let kvm = std::path::Path::new("/dev/kvm").exists();
    results.push(CheckResult {
        name: "/dev/kvm",
        ok: kvm,
        required: true,
        hint: "enable virtualization in firmware; load the kvm module",
        detail: if kvm { "present".to_string() } else { "absent".to_string() },
    });

    if probe_libvirt {
        let probe = Command::new("virsh")
            .args(["-c", &config.libvirt_uri, "version"])
            .output();
        let (ok, detail) = match probe {
            Ok(output) if output.status.success() => (true, config.libvirt_uri.clone()),
            Ok(output) => (
                false,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(e) => (false, e.to_string()),
        };
        results.push(CheckResult {
            name: "libvirt connection",
            ok,
            required: true,
            hint: "start libvirtd and check the connection URI",
            detail,
        });
    }

    let writable = std::fs::create_dir_all(config.cyber_range_dir.as_std_path()).is_ok()
        && tempfile::tempfile_in(config.cyber_range_dir.as_std_path()).is_ok();
    results.push(CheckResult {
        name: "cyber_range_dir",
        ok: writable,
        required: true,
        hint: "point cyber_range_dir at a writable location",
        detail: config.cyber_range_dir.to_string(),
    });

    results
}

/// Execute the validate command.
pub fn run(config: &Config, opts: ValidateOpts) -> Result<()> {
    let results = collect(config, !opts.skip_libvirt);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["CHECK", "STATUS", "DETAIL"]);
    for check in &results {
        let status = match (check.ok, check.required) {
            (true, _) => "ok".to_string(),
            (false, true) => "MISSING".to_string(),
            (false, false) => "missing (optional)".to_string(),
        };
        table.add_row(vec![check.name.to_string(), status, check.detail.clone()]);
    }
    println!("{table}");

    let missing: Vec<&CheckResult> = results
        .iter()
        .filter(|c| !c.ok && c.required)
        .collect();
    if !missing.is_empty() {
        let lines: Vec<String> = missing
            .iter()
            .map(|c| format!("  {}: {}", c.name, c.hint))
            .collect();
        return Err(CyrisError::Environment(format!(
            "{} required item(s) missing:\n{}",
            missing.len(),
            lines.join("\n")
        ))
        .into());
    }

    println!("\nEnvironment is ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_collect_includes_all_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cyber_range_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        let results = collect(&config, false);
        // every tool + /dev/kvm + writability
        assert_eq!(results.len(), TOOL_CHECKS.len() + 2);
        assert!(results.iter().any(|c| c.name == "virsh" && c.required));
        assert!(results.iter().any(|c| c.name == "sshpass" && !c.required));

        let writable = results
            .iter()
            .find(|c| c.name == "cyber_range_dir")
            .unwrap();
        assert!(writable.ok);
    }

    #[test]
    fn test_unwritable_dir_fails_check() {
        let mut config = Config::default();
        config.cyber_range_dir = camino::Utf8PathBuf::from("/proc/definitely/not/writable");
        let results = collect(&config, false);
        let writable = results
            .iter()
            .find(|c| c.name == "cyber_range_dir")
            .unwrap();
        assert!(!writable.ok);
    }
}
