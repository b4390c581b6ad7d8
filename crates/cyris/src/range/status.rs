//! status command - per-range detail: guests, addresses, reachability,
//! disk health and task results

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use std::net::TcpStream;
use std::time::Duration;

use crate::config::Config;
use crate::errors::CyrisError;
use crate::ip_resolver::IpResolver;
use crate::libvirt::ConnectionPool;
use crate::qemu_img;
use crate::range::MetadataStore;
use crate::resources::ResourceTracker;
use crate::tasks::TaskResult;

/// Options for the status command
#[derive(Debug, Parser)]
pub struct StatusOpts {
    /// Range to inspect
    pub range_id: String,

    /// Include disk health and task details
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Output format (table, yaml or json)
    #[clap(long, default_value = "table")]
    pub format: String,
}

/// One guest's observed state.
#[derive(Debug, Serialize)]
pub struct GuestStatus {
    /// Cloned VM name
    pub vm_name: String,
    /// Hypervisor state string
    pub state: String,
    /// Resolved address, when discovery succeeded
    pub ip: Option<String>,
    /// Method that produced the address
    pub ip_method: Option<String>,
    /// Whether TCP/22 accepted a connection
    pub ssh_reachable: bool,
    /// Overlay disk probe, in verbose mode
    pub disk: Option<DiskHealth>,
}

/// Disk probe result from `qemu-img info --force-share`.
#[derive(Debug, Serialize)]
pub struct DiskHealth {
    /// Overlay path
    pub path: String,
    /// Image format
    pub format: String,
    /// Virtual size in bytes
    pub virtual_size: u64,
    /// On-disk size in bytes
    pub actual_size: Option<u64>,
    /// Backing image, for overlays
    pub backing_file: Option<String>,
}

/// Everything the status command reports for one range.
#[derive(Debug, Serialize)]
pub struct RangeStatusReport {
    /// Range identifier
    pub range_id: String,
    /// Lifecycle state
    pub status: String,
    /// Creation time, RFC 3339
    pub created_at: String,
    /// Per-guest observations
    pub guests: Vec<GuestStatus>,
    /// Persisted task outcomes
    pub task_results: Vec<TaskResult>,
}

/// Execute the status command.
pub fn run(config: &Config, opts: StatusOpts) -> Result<()> {
    let report = collect(config, &opts.range_id, opts.verbose)?;

    match opts.format.as_str() {
        "yaml" => println!(
            "{}",
            serde_yaml::to_string(&report).context("Serialize status as YAML")?
        ),
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Serialize status as JSON")?
        ),
        "table" => render_table(&report, opts.verbose),
        other => {
            return Err(CyrisError::Config(format!("unsupported format {:?}", other)).into())
        }
    }
    Ok(())
}

/// Gather the report; separated from rendering for reuse and tests.
pub fn collect(config: &Config, range_id: &str, with_disks: bool) -> Result<RangeStatusReport> {
    let store = MetadataStore::new(&config.metadata_path());
    let metadata = store
        .get(range_id)?
        .ok_or_else(|| CyrisError::Config(format!("unknown range {:?}", range_id)))?;
    let tracker = ResourceTracker::new(&config.resources_path());
    let resources = tracker.get(range_id)?.unwrap_or_default();

    let connection = ConnectionPool::global().connect(&config.libvirt_uri);
    let resolver = IpResolver::new(
        connection.clone(),
        &config.metadata_path(),
        Duration::from_secs(config.ip_cache_ttl),
    );

    let mut guests = Vec::new();
    for (index, domain) in resources.domains.iter().enumerate() {
        let state = connection
            .domain_state(domain)
            .unwrap_or_else(|_| "undefined".to_string());
        let resolved = resolver.resolve(domain).ok();
        let ssh_reachable = resolved
            .as_ref()
            .map(|r| {
                format!("{}:22", r.ip)
                    .parse()
                    .ok()
                    .and_then(|addr| {
                        TcpStream::connect_timeout(&addr, Duration::from_secs(3)).ok()
                    })
                    .is_some()
            })
            .unwrap_or(false);

        let disk = if with_disks {
            resources.overlays.get(index).and_then(|overlay| {
                qemu_img::info(overlay).ok().map(|info| DiskHealth {
                    path: overlay.to_string(),
                    format: info.format,
                    virtual_size: info.virtual_size,
                    actual_size: info.actual_size,
                    backing_file: info.full_backing_filename.or(info.backing_filename),
                })
            })
        } else {
            None
        };

        guests.push(GuestStatus {
            vm_name: domain.clone(),
            state,
            ip: resolved.as_ref().map(|r| r.ip.clone()),
            ip_method: resolved.as_ref().map(|r| r.method.as_str().to_string()),
            ssh_reachable,
            disk,
        });
    }

    let task_results = load_task_results(&config.range_dir(range_id).join("task_results.json"));

    Ok(RangeStatusReport {
        range_id: metadata.range_id.clone(),
        status: metadata.status.to_string(),
        created_at: metadata.created_at.to_rfc3339(),
        guests,
        task_results,
    })
}

fn load_task_results(path: &Utf8PathBuf) -> Vec<TaskResult> {
    std::fs::read_to_string(path.as_std_path())
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn render_table(report: &RangeStatusReport, verbose: bool) {
    println!("Range:   {}", report.range_id);
    println!("Status:  {}", report.status);
    println!("Created: {}", report.created_at);
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["VM", "STATE", "IP", "METHOD", "SSH"]);
    for guest in &report.guests {
        table.add_row(vec![
            guest.vm_name.clone(),
            guest.state.clone(),
            guest.ip.clone().unwrap_or_else(|| "-".to_string()),
            guest.ip_method.clone().unwrap_or_else(|| "-".to_string()),
            if guest.ssh_reachable { "open" } else { "closed" }.to_string(),
        ]);
    }
    println!("{table}");

    if verbose {
        for guest in &report.guests {
            if let Some(ref disk) = guest.disk {
                println!(
                    "\n{}: {} {} (virtual {} bytes{})",
                    guest.vm_name,
                    disk.path,
                    disk.format,
                    disk.virtual_size,
                    disk.backing_file
                        .as_ref()
                        .map(|b| format!(", backed by {}", b))
                        .unwrap_or_default()
                );
            }
        }

        if !report.task_results.is_empty() {
            println!();
            let mut tasks = Table::new();
            tasks.load_preset(UTF8_FULL);
            tasks.set_header(vec!["TASK", "VM", "OK", "VERIFIED", "MESSAGE"]);
            for result in &report.task_results {
                tasks.add_row(vec![
                    result.task_type.clone(),
                    result.vm_name.clone(),
                    if result.success { "yes" } else { "no" }.to_string(),
                    if result.verification_passed { "yes" } else { "no" }.to_string(),
                    result.message.clone(),
                ]);
            }
            println!("{tasks}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeMetadata;
    use camino::Utf8Path;

    #[test]
    fn test_unknown_range_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cyber_range_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let err = collect(&config, "ghost", false).unwrap_err();
        assert!(err.to_string().contains("unknown range"), "{err}");
    }

    #[test]
    fn test_collect_without_resources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cyber_range_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let store = MetadataStore::new(&config.metadata_path());
        store.upsert(RangeMetadata::new("r1", "one")).unwrap();

        let report = collect(&config, "r1", false).unwrap();
        assert_eq!(report.range_id, "r1");
        assert_eq!(report.status, "creating");
        assert!(report.guests.is_empty());
        assert!(report.task_results.is_empty());
    }
}
