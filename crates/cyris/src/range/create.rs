//! Range creation workflow
//!
//! Drives the nine creation phases: parse, elevate, initialize, base
//! images, clone, topology, boot + readiness, guest tasks, finalize.
//! Every acquired resource pushes a compensating action; a structural
//! failure drains the stack in reverse and leaves the range in ERROR.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::builder::{self, ImageBuilder};
use crate::cloud_init::CloudInitSeed;
use crate::config::Config;
use crate::description::{self, BaseVm, Guest, InstallOverrides, RangeDescription};
use crate::elevate::PrivilegedExecutor;
use crate::errors::CyrisError;
use crate::ip_resolver::IpResolver;
use crate::ledger::{self, Ledger, OpContext, OpKind};
use crate::libvirt::{domain::DomainBuilder, domain::DomainInterface, network, virt_install, Connection, ConnectionPool};
use crate::parallel;
use crate::progress::{self, ProgressReporter};
use crate::range::{MetadataStore, RangeMetadata, RangeStatus};
use crate::resources::ResourceTracker;
use crate::ssh_exec::{SshCredentials, SshExecutor, SshTarget};
use crate::tasks::{self, Task, TaskExecutor, TaskResult};
use crate::topology::{self, SubnetPool};

/// Boot readiness probe interval; the total wait comes from
/// `ip_discovery_timeout` in the configuration (default 180 s).
const READINESS_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Options for the create command
#[derive(Debug, Parser)]
pub struct CreateOpts {
    /// Range description YAML file
    pub description: Utf8PathBuf,

    /// Parse and plan only; touch nothing
    #[clap(long)]
    pub dry_run: bool,

    /// Stop after building base images
    #[clap(long)]
    pub build_only: bool,

    /// Assume base images are already in the cache
    #[clap(long)]
    pub skip_builder: bool,

    /// Plain line-oriented progress output
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Accept descriptions with unknown keys (older releases)
    #[clap(long)]
    pub legacy: bool,
}

/// Overall outcome, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Range ACTIVE, all tasks fine (exit 0)
    Success,
    /// Range ACTIVE but some tasks failed or were skipped (exit 2)
    Partial,
}

/// A concrete VM instance derived from a guest template.
#[derive(Debug, Clone)]
struct ClonedGuest {
    vm_name: String,
    guest_id: String,
    entry_point: bool,
    kvm_auto: bool,
    os_type: String,
    vcpus: u32,
    memory: u32,
    install: InstallOverrides,
    overlay: Utf8PathBuf,
    seed_iso: Option<Utf8PathBuf>,
    base_image: Option<Utf8PathBuf>,
    /// libvirt network names, in topology declaration order
    networks: Vec<String>,
    tasks: Vec<Task>,
    ssh_user: String,
    ssh_password: Option<String>,
}

/// Compensating actions, drained in reverse on fatal failure.
#[derive(Debug)]
enum Compensation {
    UndefineDomain(String),
    DestroyNetwork(String),
    RevertFirewall(String),
    DeleteFile(Utf8PathBuf),
}

#[derive(Debug, Default)]
struct RollbackStack {
    actions: Vec<Compensation>,
}

impl RollbackStack {
    fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    /// Undo everything, newest first. Errors are logged, never raised.
    fn drain(
        &mut self,
        ledger: &Ledger,
        connection: &Connection,
        elevate: &PrivilegedExecutor,
        range_id: &str,
    ) {
        let ctx = OpContext::for_range("rollback", range_id).ignoring_errors();
        while let Some(action) = self.actions.pop() {
            debug!(?action, "rollback");
            let result: Result<()> = match &action {
                Compensation::UndefineDomain(name) => {
                    let _ = connection.destroy_domain(ledger, &ctx, name);
                    connection.undefine_domain(ledger, &ctx, name)
                }
                Compensation::DestroyNetwork(name) => {
                    connection.destroy_network(ledger, &ctx, name)
                }
                Compensation::RevertFirewall(chain) => {
                    topology::revert_firewall(ledger, elevate, &ctx, chain);
                    Ok(())
                }
                Compensation::DeleteFile(path) => {
                    match std::fs::remove_file(path.as_std_path()) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                }
            };
            if let Err(e) = result {
                warn!("rollback step failed: {e}");
                ledger.log_line(Some(range_id), &format!("rollback step failed: {e}"));
            }
        }
    }
}

/// Execute the create command.
pub fn run(config: &Config, opts: CreateOpts) -> Result<CreateOutcome> {
    let yaml = std::fs::read_to_string(opts.description.as_std_path())
        .with_context(|| format!("Failed to read description {}", opts.description))?;
    let description = description::parse_description(&yaml, opts.legacy)?;

    let reporter = progress::auto(opts.verbose);
    let mut outcome = CreateOutcome::Success;
    for clone in &description.clone_settings {
        let result = create_range(config, &opts, &description, &clone.range_id, reporter.as_ref())?;
        if result == CreateOutcome::Partial {
            outcome = CreateOutcome::Partial;
        }
    }
    Ok(outcome)
}

fn create_range(
    config: &Config,
    opts: &CreateOpts,
    description: &RangeDescription,
    range_id: &str,
    reporter: &dyn ProgressReporter,
) -> Result<CreateOutcome> {
    let started = Instant::now();
    let ledger = Ledger::global();
    let elevate = PrivilegedExecutor::new();
    let connection = ConnectionPool::global().connect(&config.libvirt_uri);
    let metadata_store = MetadataStore::new(&config.metadata_path());
    let resources = ResourceTracker::new(&config.resources_path());

    let clone = description
        .clone_settings
        .iter()
        .find(|c| c.range_id == range_id)
        .expect("caller passes an existing range id");

    if opts.dry_run {
        return dry_run_report(config, description, range_id, reporter);
    }

    // Phase 2: privileges, proactively, before anything long-running.
    reporter.start_phase("Acquire privileges");
    elevate.acquire(ledger, Some(range_id))?;

    // Phase 3: initialize range state.
    reporter.start_phase("Initialize range creation");
    let range_dir = config.range_dir(range_id);
    std::fs::create_dir_all(range_dir.as_std_path())
        .with_context(|| format!("Failed to create range directory {}", range_dir))?;
    ledger.set_base_dir(&config.cyber_range_dir);
    ledger.log_line(Some(range_id), "Initialize range creation");

    let mut metadata = RangeMetadata::new(range_id, range_id);
    metadata.config_path = Some(opts.description.clone());
    metadata.logs_path = Some(range_dir.join("creation.log"));
    metadata_store.upsert(metadata)?;

    let mut rollback = RollbackStack::default();
    let result = create_phases(
        config,
        opts,
        description,
        range_id,
        clone,
        reporter,
        ledger,
        &elevate,
        &connection,
        &metadata_store,
        &resources,
        &mut rollback,
    );

    match result {
        Ok(outcome) => {
            if opts.build_only {
                // Images are in the cache; nothing else was provisioned.
                metadata_store.remove(range_id)?;
                ledger.close_range(range_id);
                reporter.finish(true, started.elapsed());
                return Ok(CreateOutcome::Success);
            }
            let elapsed = started.elapsed();
            // The ledger decides SUCCESS/FAILURE: non-fatal task failures
            // are recorded as ignorable and do not flip the verdict.
            let summary = ledger.aggregate(range_id);
            ledger::write_status_file(&range_dir, summary.success())?;
            ledger.log_line(
                Some(range_id),
                &format!(
                    "Creation result: {} (took {:.1}s)",
                    if summary.success() { "SUCCESS" } else { "FAILURE" },
                    elapsed.as_secs_f64()
                ),
            );
            ledger.close_range(range_id);
            reporter.finish(summary.success(), elapsed);
            Ok(match outcome {
                PhaseOutcome::Ok => CreateOutcome::Success,
                PhaseOutcome::Partial => CreateOutcome::Partial,
            })
        }
        Err(e) => {
            reporter.report_error(
                &format!("range {} creation failed: {}", range_id, e),
                &range_dir.join("creation.log"),
            );
            rollback.drain(ledger, &connection, &elevate, range_id);
            let _ = metadata_store.update_status(range_id, RangeStatus::Error);
            let _ = ledger::write_status_file(&range_dir, false);
            ledger.log_line(
                Some(range_id),
                &format!(
                    "Creation result: FAILURE (took {:.1}s)",
                    started.elapsed().as_secs_f64()
                ),
            );
            ledger.close_range(range_id);
            reporter.finish(false, started.elapsed());
            Err(e)
        }
    }
}

/// Internal outcome of the phase runner, distinguishing "all good" from
/// "active with failed tasks".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Ok,
    Partial,
}

#[allow(clippy::too_many_arguments)]
fn create_phases(
    config: &Config,
    opts: &CreateOpts,
    description: &RangeDescription,
    range_id: &str,
    clone: &crate::description::CloneSetting,
    reporter: &dyn ProgressReporter,
    ledger: &'static Ledger,
    elevate: &PrivilegedExecutor,
    connection: &Arc<Connection>,
    metadata_store: &MetadataStore,
    resources: &ResourceTracker,
    rollback: &mut RollbackStack,
) -> Result<PhaseOutcome> {
    let range_dir = config.range_dir(range_id);

    // Phase 4: base images, one build per unique key.
    reporter.start_phase("Base images");
    let image_builder = ImageBuilder::new(&config.image_cache_dir(), elevate);
    let ctx = OpContext::for_range("base images", range_id);
    let mut built_images: HashMap<String, Utf8PathBuf> = HashMap::new();

    for guest in &description.guest_settings {
        let BaseVm::KvmAuto {
            ref image_name,
            ref disk_size,
            ..
        } = guest.base
        else {
            continue;
        };
        let build_tasks = builder::build_time_tasks(&tasks::flatten(&guest.tasks));
        let key = builder::cache_key(image_name, disk_size, &build_tasks);
        if built_images.contains_key(&key) {
            continue;
        }
        let path = if opts.skip_builder {
            let path = builder::image_path(&config.image_cache_dir(), image_name, &key);
            if !path.exists() {
                return Err(CyrisError::Environment(format!(
                    "--skip-builder was given but {} is missing",
                    path
                ))
                .into());
            }
            path
        } else {
            image_builder.validate_image_name(image_name)?;
            reporter.step(&format!("building {}", image_name));
            image_builder.build(&ctx, image_name, disk_size, &build_tasks)?
        };
        resources.record(range_id, |r| {
            if !r.base_images.contains(&path) {
                r.base_images.push(path.clone());
            }
        })?;
        built_images.insert(key, path);
    }

    // Distribute built images to remote hosts.
    let remote_hosts: Vec<SshTarget> = clone
        .hosts
        .iter()
        .filter_map(|h| description.host(&h.host_id))
        .filter(|h| !h.is_local())
        .map(|h| SshTarget::new(&h.account, &h.mgmt_addr))
        .collect();
    if !remote_hosts.is_empty() {
        let ssh = SshExecutor::new(config, SshCredentials::default());
        for image in built_images.values() {
            reporter.step(&format!("distributing {}", image));
            image_builder.distribute(
                &ctx,
                &ssh,
                &remote_hosts,
                image,
                config.image_distribution_concurrency as usize,
            )?;
        }
    }

    if opts.build_only {
        return Ok(PhaseOutcome::Ok);
    }

    // Phase 5: clone VMs (overlays, seed ISOs, domain definitions).
    reporter.start_phase("Clone VMs");
    let mut cloned: Vec<ClonedGuest> = Vec::new();
    let mut instances: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for host in &clone.hosts {
        for clone_guest in &host.guests {
            let guest = description
                .guest(&clone_guest.guest_id)
                .expect("validated reference");
            let count = host.instance_number * clone_guest.number;
            for _ in 0..count {
                let suffix = Uuid::new_v4().simple().to_string()[..12].to_string();
                let vm_name = format!("cyris-{}-{}", guest.id, suffix);
                let prepared = prepare_clone(
                    config, range_id, guest, &vm_name, clone_guest.entry_point, &built_images,
                )?;
                instances
                    .entry(guest.id.clone())
                    .or_default()
                    .push(vm_name.clone());
                cloned.push(prepared);
            }
        }
    }

    // Topology plan is needed before domains are defined: interfaces
    // reference the range networks.
    let mut pool = SubnetPool::new();
    let mut planned_networks = Vec::new();
    let mut firewall_rules = Vec::new();
    for host in &clone.hosts {
        for topo in &host.topology {
            let mut planned = topology::plan_networks(range_id, topo, &instances, &mut pool)?;
            firewall_rules.extend(topo.parsed_rules()?);
            planned_networks.append(&mut planned);
        }
    }
    for guest in &mut cloned {
        guest.networks = planned_networks
            .iter()
            .filter(|n| n.assignments.iter().any(|a| a.vm_name == guest.vm_name))
            .map(|n| n.bridge.clone())
            .collect();
    }

    let ctx = OpContext::for_range("clone", range_id);
    for guest in &cloned {
        reporter.step(&format!("preparing {}", guest.vm_name));
        if let Some(ref base) = guest.base_image {
            crate::qemu_img::create_overlay(ledger, &ctx, base, &guest.overlay)?;
            rollback.push(Compensation::DeleteFile(guest.overlay.clone()));
            resources.record(range_id, |r| r.overlays.push(guest.overlay.clone()))?;
        }
        if let Some(ref iso) = guest.seed_iso {
            let seed = seed_for(guest, range_id);
            seed.write_iso(ledger, &ctx, iso)?;
            rollback.push(Compensation::DeleteFile(iso.clone()));
            resources.record(range_id, |r| r.isos.push(iso.clone()))?;
        }
        if !guest.kvm_auto {
            let xml = classic_domain_xml(guest, range_id)?;
            connection.define_domain(ledger, &ctx, &xml)?;
            rollback.push(Compensation::UndefineDomain(guest.vm_name.clone()));
        }
        resources.record(range_id, |r| r.domains.push(guest.vm_name.clone()))?;
    }

    // Phase 6: networks and forwarding policy.
    reporter.start_phase("Setup network topology");
    let ctx = OpContext::for_range("topology", range_id);
    for planned in &planned_networks {
        let definition = network::NetworkDefinition {
            name: planned.bridge.clone(),
            gateway: planned.cidr.gateway(),
            netmask: planned.cidr.netmask(),
        };
        connection.create_network(ledger, &ctx, &definition.build_xml()?)?;
        connection.start_network(ledger, &ctx, &planned.bridge)?;
        rollback.push(Compensation::DestroyNetwork(planned.bridge.clone()));
        resources.record(range_id, |r| r.networks.push(planned.bridge.clone()))?;
    }

    let assignment_map = topology::assignment_map(&planned_networks);
    metadata_store.set_tag(
        range_id,
        "ip_assignments",
        serde_json::to_value(&assignment_map).expect("string map"),
    )?;
    let entry_points: Vec<&str> = cloned
        .iter()
        .filter(|g| g.entry_point)
        .map(|g| g.vm_name.as_str())
        .collect();
    metadata_store.set_tag(
        range_id,
        "entry_points",
        serde_json::to_value(&entry_points).expect("string list"),
    )?;
    let ssh_users: BTreeMap<&str, &str> = cloned
        .iter()
        .map(|g| (g.vm_name.as_str(), g.ssh_user.as_str()))
        .collect();
    metadata_store.set_tag(
        range_id,
        "ssh_users",
        serde_json::to_value(&ssh_users).expect("string map"),
    )?;
    resources.record(range_id, |r| {
        r.ip_reservations.extend(assignment_map.clone());
    })?;

    if !firewall_rules.is_empty() {
        let plan = topology::build_firewall_plan(range_id, &firewall_rules, &planned_networks)?;
        topology::apply_firewall(ledger, elevate, &ctx, &plan)?;
        rollback.push(Compensation::RevertFirewall(plan.chain.clone()));
        resources.record(range_id, |r| r.firewall_chain = Some(plan.chain.clone()))?;
    }

    // Phase 7: start and await readiness.
    reporter.start_phase("Start VMs and await readiness");
    let ctx = OpContext::for_range("start", range_id);
    for guest in &cloned {
        if guest.kvm_auto {
            let spec = virt_install::VirtInstallSpec {
                uri: config.libvirt_uri.clone(),
                name: guest.vm_name.clone(),
                memory_mib: guest.memory,
                vcpus: guest.vcpus,
                disk: guest.overlay.to_string(),
                seed_iso: guest.seed_iso.as_ref().map(|p| p.to_string()),
                networks: guest.networks.clone(),
                os_type: guest.os_type.clone(),
                overrides: guest.install.clone(),
            };
            let args = virt_install::synthesize(&spec);
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            let mut cmd = std::process::Command::new("virt-install");
            cmd.args(&arg_refs);
            ledger.run_logged(&mut cmd, OpKind::Hypervisor, &ctx)?;
            rollback.push(Compensation::UndefineDomain(guest.vm_name.clone()));
        } else {
            connection.start_domain(ledger, &ctx, &guest.vm_name)?;
        }
    }

    let resolver = IpResolver::new(
        connection.clone(),
        &config.metadata_path(),
        Duration::from_secs(config.ip_cache_ttl),
    );
    let worker_count = cloned.len().min(parallel::DEFAULT_WORKERS);
    let readiness_deadline = Duration::from_secs(config.ip_discovery_timeout);
    let readiness: Vec<(String, Option<String>)> = parallel::run_bounded(
        cloned.iter().map(|g| g.vm_name.clone()).collect(),
        worker_count.max(1),
        |vm_name| {
            let ip = await_readiness(&resolver, &vm_name, readiness_deadline);
            (vm_name, ip)
        },
    );
    let ip_by_vm: HashMap<String, Option<String>> = readiness.into_iter().collect();

    // Phase 8: guest tasks, parallel across guests, sequential within.
    reporter.start_phase("Execute guest tasks");
    let jobs: Vec<ClonedGuest> = cloned.clone();
    let task_results: Vec<Vec<TaskResult>> =
        parallel::run_bounded(jobs, worker_count.max(1), |guest| {
            let ctx = OpContext::for_range("tasks", range_id).with_guest(&guest.vm_name);
            match ip_by_vm.get(&guest.vm_name).and_then(|ip| ip.clone()) {
                Some(ip) => {
                    let ssh = SshExecutor::new(
                        config,
                        SshCredentials {
                            key_path: None,
                            password: guest.ssh_password.clone(),
                        },
                    );
                    let executor = TaskExecutor::new(&ssh);
                    executor.run_tasks(
                        &ctx,
                        &guest.vm_name,
                        &ip,
                        &guest.ssh_user,
                        &guest.os_type,
                        &guest.tasks,
                        guest.kvm_auto,
                    )
                }
                None => {
                    ledger.log_line(
                        Some(range_id),
                        &format!("{} never became reachable; tasks skipped", guest.vm_name),
                    );
                    tasks::skip_all(&guest.tasks, &guest.vm_name, "guest not reachable")
                }
            }
        });

    let flat_results: Vec<TaskResult> = task_results.into_iter().flatten().collect();
    persist_task_results(&range_dir, &flat_results)?;

    let fatal_failure = flat_results.iter().any(|result| {
        if result.success {
            return false;
        }
        // task_id is `<vm>:<index>:<kind>`; vm names carry no colons
        let mut parts = result.task_id.rsplitn(3, ':');
        let _kind = parts.next();
        let Some(index) = parts.next().and_then(|i| i.parse::<usize>().ok()) else {
            return false;
        };
        cloned
            .iter()
            .find(|g| g.vm_name == result.vm_name)
            .and_then(|g| g.tasks.get(index))
            .map(|t| t.fatal())
            .unwrap_or(false)
    });
    if fatal_failure {
        return Err(CyrisError::Task("a fatal guest task failed".into()).into());
    }

    // Phase 9: finalize.
    reporter.start_phase("Finalize");
    metadata_store.update_status(range_id, RangeStatus::Active)?;
    resolver.invalidate();

    let any_task_trouble = flat_results
        .iter()
        .any(|r| !r.success || !r.verification_passed);
    Ok(if any_task_trouble {
        PhaseOutcome::Partial
    } else {
        PhaseOutcome::Ok
    })
}

fn prepare_clone(
    config: &Config,
    range_id: &str,
    guest: &Guest,
    vm_name: &str,
    entry_point: bool,
    built_images: &HashMap<String, Utf8PathBuf>,
) -> Result<ClonedGuest> {
    let range_dir = config.range_dir(range_id);
    let overlay = range_dir.join("disks").join(format!("{}.qcow2", vm_name));
    let flattened = tasks::flatten(&guest.tasks);
    let (ssh_user, ssh_password) = guest_credentials(&flattened);

    match &guest.base {
        BaseVm::KvmAuto {
            image_name,
            vcpus,
            memory,
            disk_size,
            install,
        } => {
            let build_tasks = builder::build_time_tasks(&flattened);
            let key = builder::cache_key(image_name, disk_size, &build_tasks);
            let base_image = built_images
                .get(&key)
                .cloned()
                .unwrap_or_else(|| builder::image_path(&config.image_cache_dir(), image_name, &key));
            Ok(ClonedGuest {
                vm_name: vm_name.to_string(),
                guest_id: guest.id.clone(),
                entry_point,
                kvm_auto: true,
                os_type: guest.os_type()?,
                vcpus: *vcpus,
                memory: *memory,
                install: install.clone(),
                overlay,
                seed_iso: Some(range_dir.join(format!("{}-cloud-init.iso", vm_name))),
                base_image: Some(base_image),
                networks: Vec::new(),
                tasks: flattened,
                ssh_user,
                ssh_password,
            })
        }
        BaseVm::Kvm {
            basevm_config_file,
            basevm_os_type,
            ..
        } => {
            let base_disk = base_disk_from_config(basevm_config_file)?;
            Ok(ClonedGuest {
                vm_name: vm_name.to_string(),
                guest_id: guest.id.clone(),
                entry_point,
                kvm_auto: false,
                os_type: basevm_os_type.clone(),
                vcpus: 1,
                memory: 1024,
                install: InstallOverrides::default(),
                overlay,
                seed_iso: None,
                base_image: Some(base_disk),
                networks: Vec::new(),
                tasks: flattened,
                ssh_user,
                ssh_password,
            })
        }
        BaseVm::Aws { .. } => Err(CyrisError::Environment(
            "the aws provider is not built into this binary".into(),
        )
        .into()),
    }
}

/// Pick the per-guest SSH identity: the first added account's credentials
/// when present, root otherwise.
fn guest_credentials(tasks: &[Task]) -> (String, Option<String>) {
    for task in tasks {
        if let Task::AddAccount(spec) = task {
            return (spec.account.clone(), Some(spec.passwd.clone()));
        }
    }
    ("root".to_string(), None)
}

/// The base VM's disk, pulled out of its libvirt XML definition.
fn base_disk_from_config(config_file: &Utf8Path) -> Result<Utf8PathBuf> {
    let xml = std::fs::read_to_string(config_file.as_std_path())
        .with_context(|| format!("Failed to read base VM config {}", config_file))?;
    let dom = crate::xml_utils::parse_xml_dom(&xml)?;
    let mut disks = Vec::new();
    dom.find_all("disk", &mut disks);
    for disk in disks {
        if disk.attr("device").unwrap_or("disk") != "disk" {
            continue;
        }
        if let Some(source) = disk.find("source").and_then(|s| s.attr("file")) {
            return Ok(Utf8PathBuf::from(source));
        }
    }
    Err(CyrisError::Config(format!(
        "base VM config {} declares no file-backed disk",
        config_file
    ))
    .into())
}

fn seed_for(guest: &ClonedGuest, range_id: &str) -> CloudInitSeed {
    let mut seed = CloudInitSeed::new(&guest.vm_name, &format!("{}-{}", range_id, guest.vm_name));
    if guest.ssh_password.is_some() {
        seed.account = Some(guest.ssh_user.clone());
        seed.password = guest.ssh_password.clone();
    }
    seed
}

/// Domain XML for the classic clone-from-XML path.
fn classic_domain_xml(guest: &ClonedGuest, range_id: &str) -> Result<String> {
    let mut builder = DomainBuilder::new()
        .with_name(&guest.vm_name)
        .with_memory(guest.memory)
        .with_vcpus(guest.vcpus)
        .with_range_metadata(range_id, &guest.guest_id, &guest.os_type);
    if let Some(ref base) = guest.base_image {
        builder = builder.with_overlay_disk(guest.overlay.as_str(), base.as_str());
    }
    for network in &guest.networks {
        builder = builder.with_interface(DomainInterface {
            network: network.clone(),
            model: "virtio".to_string(),
            mac: None,
        });
    }
    builder.build_xml()
}

/// Wait for a guest to have an IP and an open SSH port.
fn await_readiness(resolver: &IpResolver, vm_name: &str, deadline: Duration) -> Option<String> {
    let started = Instant::now();
    loop {
        if let Ok(resolved) = resolver.resolve(vm_name) {
            if ssh_port_open(&resolved.ip) {
                return Some(resolved.ip);
            }
        }
        if started.elapsed() >= deadline {
            return None;
        }
        std::thread::sleep(READINESS_PROBE_INTERVAL);
    }
}

fn ssh_port_open(ip: &str) -> bool {
    let address = format!("{}:22", ip);
    address
        .parse()
        .ok()
        .and_then(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(3)).ok())
        .is_some()
}

fn persist_task_results(range_dir: &Utf8Path, results: &[TaskResult]) -> Result<()> {
    let path = range_dir.join("task_results.json");
    let serialized = serde_json::to_string_pretty(results).context("Serialize task results")?;
    std::fs::write(path.as_std_path(), serialized)
        .with_context(|| format!("Failed to write task results under {}", range_dir))
}

fn dry_run_report(
    config: &Config,
    description: &RangeDescription,
    range_id: &str,
    reporter: &dyn ProgressReporter,
) -> Result<CreateOutcome> {
    reporter.start_phase("Dry run");
    let clone = description
        .clone_settings
        .iter()
        .find(|c| c.range_id == range_id)
        .expect("caller passes an existing range id");

    let mut guest_count = 0u32;
    for host in &clone.hosts {
        for g in &host.guests {
            guest_count += host.instance_number * g.number;
        }
    }
    let network_count: usize = clone.hosts.iter().map(|h| {
        h.topology.iter().map(|t| t.networks.len()).sum::<usize>()
    }).sum();

    reporter.step(&format!(
        "range {}: {} guest(s), {} network(s), directory {}",
        range_id,
        guest_count,
        network_count,
        config.range_dir(range_id)
    ));
    reporter.step("dry run: no resources created");
    Ok(CreateOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_credentials_prefer_first_account() {
        let tasks = vec![
            Task::InstallPackage(crate::tasks::InstallPackageSpec {
                name: "curl".to_string(),
                package_manager: None,
                version: None,
                fatal: false,
            }),
            Task::AddAccount(crate::tasks::AddAccountSpec {
                account: "trainee".to_string(),
                passwd: "t123".to_string(),
                groups: vec![],
                sudo: false,
                also_runtime: false,
                fatal: false,
            }),
            Task::AddAccount(crate::tasks::AddAccountSpec {
                account: "second".to_string(),
                passwd: "x".to_string(),
                groups: vec![],
                sudo: false,
                also_runtime: false,
                fatal: false,
            }),
        ];
        let (user, password) = guest_credentials(&tasks);
        assert_eq!(user, "trainee");
        assert_eq!(password.as_deref(), Some("t123"));

        let (user, password) = guest_credentials(&[]);
        assert_eq!(user, "root");
        assert_eq!(password, None);
    }

    #[test]
    fn test_base_disk_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = Utf8Path::from_path(dir.path()).unwrap().join("base.xml");
        std::fs::write(
            config_path.as_std_path(),
            r#"<domain type="kvm">
                <name>base</name>
                <devices>
                    <disk type="file" device="cdrom">
                        <source file="/iso/installer.iso"/>
                    </disk>
                    <disk type="file" device="disk">
                        <driver name="qemu" type="qcow2"/>
                        <source file="/var/lib/libvirt/images/base.qcow2"/>
                    </disk>
                </devices>
            </domain>"#,
        )
        .unwrap();
        let disk = base_disk_from_config(&config_path).unwrap();
        assert_eq!(disk, "/var/lib/libvirt/images/base.qcow2");
    }

    #[test]
    fn test_base_disk_missing_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = Utf8Path::from_path(dir.path()).unwrap().join("nodisk.xml");
        std::fs::write(
            config_path.as_std_path(),
            r#"<domain><name>x</name><devices></devices></domain>"#,
        )
        .unwrap();
        assert!(base_disk_from_config(&config_path).is_err());
    }

    #[test]
    fn test_rollback_stack_is_lifo() {
        let mut stack = RollbackStack::default();
        stack.push(Compensation::DeleteFile(Utf8PathBuf::from("/a")));
        stack.push(Compensation::UndefineDomain("d".to_string()));
        stack.push(Compensation::DestroyNetwork("n".to_string()));

        let order: Vec<String> = std::iter::from_fn(|| stack.actions.pop())
            .map(|c| match c {
                Compensation::UndefineDomain(_) => "domain".to_string(),
                Compensation::DestroyNetwork(_) => "network".to_string(),
                Compensation::RevertFirewall(_) => "firewall".to_string(),
                Compensation::DeleteFile(_) => "file".to_string(),
            })
            .collect();
        assert_eq!(order, vec!["network", "domain", "file"]);
    }

    #[test]
    fn test_ssh_port_probe_rejects_bad_ip() {
        assert!(!ssh_port_open("not-an-ip"));
    }
}
