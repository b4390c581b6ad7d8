//! Guest task execution with per-task verification
//!
//! Tasks arrive as ordered YAML entries per guest template and run after
//! the guest is reachable over SSH. Within one guest tasks run strictly
//! sequentially; failure verification evidence is captured into a
//! [`TaskResult`] per task. A failed task does not abort the range unless
//! it is marked `fatal: true`. Account tasks for kvm-auto guests are
//! normally applied at image build time; the executor skips them post-boot
//! unless `also_runtime` asks otherwise.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::ledger::OpContext;
use crate::ssh_exec::{SshExecutor, SshOutput, SshTarget};

/// Default per-task command timeout.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Accept YAML 1.1 style truthy scalars (`yes`, `on`, ...) for booleans.
pub(crate) fn truthy<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<bool, D::Error> {
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::Bool(b) => Ok(b),
        serde_yaml::Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => Ok(true),
            "no" | "off" | "false" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, got {:?}",
                other
            ))),
        },
        other => Err(serde::de::Error::custom(format!(
            "expected a boolean, got {:?}",
            other
        ))),
    }
}

/// Parameters for creating a training account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddAccountSpec {
    /// Account name
    pub account: String,
    /// Initial password
    pub passwd: String,
    /// Supplementary groups
    #[serde(default)]
    pub groups: Vec<String>,
    /// Grant passwordless sudo
    #[serde(default, deserialize_with = "truthy")]
    pub sudo: bool,
    /// Repeat post-boot even when applied at image build time
    #[serde(default, deserialize_with = "truthy")]
    pub also_runtime: bool,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// Parameters for changing or renaming an existing account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyAccountSpec {
    /// Account to change
    pub account: String,
    /// New password, when set
    #[serde(default)]
    pub new_passwd: Option<String>,
    /// New account name, when renaming
    #[serde(default)]
    pub new_account: Option<String>,
    /// Repeat post-boot even when applied at image build time
    #[serde(default, deserialize_with = "truthy")]
    pub also_runtime: bool,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// Parameters for installing a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPackageSpec {
    /// Package name
    pub name: String,
    /// Explicit package manager (derived from the OS when unset)
    #[serde(default)]
    pub package_manager: Option<String>,
    /// Version pin
    #[serde(default)]
    pub version: Option<String>,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// Parameters for copying content into the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyContentSpec {
    /// Local source file or directory
    pub src: String,
    /// Destination path inside the guest
    pub dst: String,
    /// Verify with a sha256 comparison on top of size+mtime
    #[serde(default, deserialize_with = "truthy")]
    pub checksum: bool,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// Parameters for running a program inside the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteProgramSpec {
    /// Program or script path
    pub program: String,
    /// Interpreter to prefix (`bash`, `python3`, ...)
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Argument string appended verbatim
    #[serde(default)]
    pub args: Option<String>,
    /// Run as this user (root when unset)
    #[serde(default)]
    pub user: Option<String>,
    /// Regex the program stdout must match for verification
    #[serde(default)]
    pub expect_stdout: Option<String>,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// Parameters for the attack emulation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulateAttackSpec {
    /// Attack kind (`ssh_attack` is the only supported one)
    #[serde(default = "default_attack_type")]
    pub attack_type: String,
    /// Account the failed logins target
    pub target_account: String,
    /// Number of login attempts
    #[serde(default = "default_attempts")]
    pub attempt_number: u32,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

fn default_attack_type() -> String {
    "ssh_attack".to_string()
}

fn default_attempts() -> u32 {
    10
}

/// Parameters for the benign malware daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulateMalwareSpec {
    /// Daemon name, also the process marker
    pub name: String,
    /// Behavior mode
    #[serde(default = "default_malware_mode")]
    pub mode: String,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

fn default_malware_mode() -> String {
    "dummy_calculation".to_string()
}

/// Parameters for replaying a packet capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficCaptureSpec {
    /// Capture file path inside the guest
    pub pcap_file: String,
    /// Interface to replay on
    #[serde(default = "default_iface")]
    pub iface: String,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

fn default_iface() -> String {
    "eth0".to_string()
}

/// Parameters for applying a firewall ruleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRulesSpec {
    /// Local iptables-restore file to apply
    pub rule_file: String,
    /// Failure aborts the whole range
    #[serde(default, deserialize_with = "truthy")]
    pub fatal: bool,
}

/// One YAML task entry: a single task kind with a list of parameter sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEntry {
    /// `add_account` entries
    AddAccount(Vec<AddAccountSpec>),
    /// `modify_account` entries
    ModifyAccount(Vec<ModifyAccountSpec>),
    /// `install_package` entries
    InstallPackage(Vec<InstallPackageSpec>),
    /// `copy_content` entries
    CopyContent(Vec<CopyContentSpec>),
    /// `execute_program` entries
    ExecuteProgram(Vec<ExecuteProgramSpec>),
    /// `emulate_attack` entries
    EmulateAttack(Vec<EmulateAttackSpec>),
    /// `emulate_malware` entries
    EmulateMalware(Vec<EmulateMalwareSpec>),
    /// `emulate_traffic_capture_file` entries
    EmulateTrafficCaptureFile(Vec<TrafficCaptureSpec>),
    /// `firewall_rules` entries
    FirewallRules(Vec<FirewallRulesSpec>),
}

/// One concrete task, flattened from the entry lists, order preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    /// Create a training account
    AddAccount(AddAccountSpec),
    /// Change or rename an account
    ModifyAccount(ModifyAccountSpec),
    /// Install a package
    InstallPackage(InstallPackageSpec),
    /// Copy content into the guest
    CopyContent(CopyContentSpec),
    /// Run a program
    ExecuteProgram(ExecuteProgramSpec),
    /// Emulate an SSH brute-force attack
    EmulateAttack(EmulateAttackSpec),
    /// Start the benign malware daemon
    EmulateMalware(EmulateMalwareSpec),
    /// Replay a packet capture
    EmulateTrafficCaptureFile(TrafficCaptureSpec),
    /// Apply a firewall ruleset
    FirewallRules(FirewallRulesSpec),
}

impl Task {
    /// The task's YAML kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::AddAccount(_) => "add_account",
            Task::ModifyAccount(_) => "modify_account",
            Task::InstallPackage(_) => "install_package",
            Task::CopyContent(_) => "copy_content",
            Task::ExecuteProgram(_) => "execute_program",
            Task::EmulateAttack(_) => "emulate_attack",
            Task::EmulateMalware(_) => "emulate_malware",
            Task::EmulateTrafficCaptureFile(_) => "emulate_traffic_capture_file",
            Task::FirewallRules(_) => "firewall_rules",
        }
    }

    /// Whether a failure of this task aborts the range.
    pub fn fatal(&self) -> bool {
        match self {
            Task::AddAccount(s) => s.fatal,
            Task::ModifyAccount(s) => s.fatal,
            Task::InstallPackage(s) => s.fatal,
            Task::CopyContent(s) => s.fatal,
            Task::ExecuteProgram(s) => s.fatal,
            Task::EmulateAttack(s) => s.fatal,
            Task::EmulateMalware(s) => s.fatal,
            Task::EmulateTrafficCaptureFile(s) => s.fatal,
            Task::FirewallRules(s) => s.fatal,
        }
    }

    /// Account tasks can be applied inside the image at build time.
    pub fn is_build_time(&self) -> bool {
        matches!(self, Task::AddAccount(_) | Task::ModifyAccount(_))
    }

    /// Whether a build-time task also wants a post-boot run.
    pub fn also_runtime(&self) -> bool {
        match self {
            Task::AddAccount(s) => s.also_runtime,
            Task::ModifyAccount(s) => s.also_runtime,
            _ => false,
        }
    }
}

/// Flatten entries into the ordered task list.
pub fn flatten(entries: &[TaskEntry]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for entry in entries {
        match entry {
            TaskEntry::AddAccount(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::AddAccount))
            }
            TaskEntry::ModifyAccount(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::ModifyAccount))
            }
            TaskEntry::InstallPackage(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::InstallPackage))
            }
            TaskEntry::CopyContent(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::CopyContent))
            }
            TaskEntry::ExecuteProgram(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::ExecuteProgram))
            }
            TaskEntry::EmulateAttack(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::EmulateAttack))
            }
            TaskEntry::EmulateMalware(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::EmulateMalware))
            }
            TaskEntry::EmulateTrafficCaptureFile(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::EmulateTrafficCaptureFile))
            }
            TaskEntry::FirewallRules(specs) => {
                tasks.extend(specs.iter().cloned().map(Task::FirewallRules))
            }
        }
    }
    tasks
}

/// Outcome of one task on one guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// `<vm>:<index>:<kind>` identifier
    pub task_id: String,
    /// Task kind name
    pub task_type: String,
    /// Cloned VM the task ran on
    pub vm_name: String,
    /// Address the task was dispatched to
    pub vm_ip: String,
    /// Whether action and verification both succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Runtime in seconds
    pub elapsed_secs: f64,
    /// Captured stdout of the action
    pub output: String,
    /// Error detail when the action failed
    pub error: Option<String>,
    /// Post-verification observation (e.g. the `id` output)
    pub evidence: Option<String>,
    /// Whether the post-action verification held
    pub verification_passed: bool,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    fn skipped(task: &Task, index: usize, vm_name: &str, vm_ip: &str, reason: &str) -> Self {
        Self {
            task_id: format!("{}:{}:{}", vm_name, index, task.kind()),
            task_type: task.kind().to_string(),
            vm_name: vm_name.to_string(),
            vm_ip: vm_ip.to_string(),
            success: true,
            message: format!("skipped: {}", reason),
            elapsed_secs: 0.0,
            output: String::new(),
            error: None,
            evidence: None,
            verification_passed: true,
            timestamp: Utc::now(),
        }
    }
}

/// Mark every task of an unreachable guest as skipped.
pub fn skip_all(tasks: &[Task], vm_name: &str, reason: &str) -> Vec<TaskResult> {
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let mut result = TaskResult::skipped(task, index, vm_name, "", reason);
            result.success = false;
            result.verification_passed = false;
            result
        })
        .collect()
}

// Command synthesis is split from execution so the exact remote command
// lines are unit-testable without a guest.

/// Creation commands for an account; idempotent (an existing user is fine).
pub fn add_account_commands(spec: &AddAccountSpec) -> Vec<String> {
    let mut commands = vec![
        format!(
            "id {account} >/dev/null 2>&1 || useradd -m -s /bin/bash {account}",
            account = spec.account
        ),
        format!("echo '{}:{}' | chpasswd", spec.account, spec.passwd),
    ];
    if !spec.groups.is_empty() {
        commands.push(format!(
            "usermod -aG {} {}",
            spec.groups.join(","),
            spec.account
        ));
    }
    if spec.sudo {
        commands.push(format!(
            "usermod -aG sudo {account} 2>/dev/null || usermod -aG wheel {account}",
            account = spec.account
        ));
    }
    commands
}

/// Change commands for an account rename and/or password change.
pub fn modify_account_commands(spec: &ModifyAccountSpec) -> Vec<String> {
    let mut commands = Vec::new();
    if let Some(ref new_account) = spec.new_account {
        commands.push(format!(
            "usermod -l {} -d /home/{} -m {}",
            new_account, new_account, spec.account
        ));
    }
    if let Some(ref new_passwd) = spec.new_passwd {
        let account = spec.new_account.as_deref().unwrap_or(&spec.account);
        commands.push(format!("echo '{}:{}' | chpasswd", account, new_passwd));
    }
    commands
}

/// Install command for the guest's package manager.
pub fn install_package_command(spec: &InstallPackageSpec, os_type: &str) -> String {
    let manager = spec
        .package_manager
        .clone()
        .unwrap_or_else(|| default_package_manager(os_type).to_string());
    let package = match spec.version {
        Some(ref version) if manager == "apt" || manager == "apt-get" => {
            format!("{}={}", spec.name, version)
        }
        Some(ref version) => format!("{}-{}", spec.name, version),
        None => spec.name.clone(),
    };
    match manager.as_str() {
        "apt" | "apt-get" => format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
            package
        ),
        "yum" => format!("yum install -y {}", package),
        "dnf" => format!("dnf install -y {}", package),
        other => format!("{} install -y {}", other, package),
    }
}

/// Query that verifies the package landed.
pub fn verify_package_command(spec: &InstallPackageSpec, os_type: &str) -> String {
    let manager = spec
        .package_manager
        .clone()
        .unwrap_or_else(|| default_package_manager(os_type).to_string());
    match manager.as_str() {
        "apt" | "apt-get" => format!("dpkg -s {}", spec.name),
        "yum" | "dnf" => format!("rpm -q {}", spec.name),
        _ => format!("command -v {}", spec.name),
    }
}

/// The package manager conventionally present on an OS type.
pub fn default_package_manager(os_type: &str) -> &'static str {
    if os_type.starts_with("ubuntu") || os_type.starts_with("debian") {
        "apt-get"
    } else if os_type.starts_with("centos") || os_type.starts_with("fedora") {
        "dnf"
    } else {
        "apt-get"
    }
}

/// The remote invocation for an execute_program task.
pub fn execute_program_command(spec: &ExecuteProgramSpec) -> String {
    let mut invocation = String::new();
    if let Some(ref user) = spec.user {
        invocation.push_str(&format!("sudo -u {} ", user));
    }
    if let Some(ref interpreter) = spec.interpreter {
        invocation.push_str(interpreter);
        invocation.push(' ');
    }
    invocation.push_str(&spec.program);
    if let Some(ref args) = spec.args {
        invocation.push(' ');
        invocation.push_str(args);
    }
    invocation
}

/// SSH brute-force emulation: repeated failed logins against the target
/// account on the guest itself, leaving the usual auth log trail.
pub fn emulate_attack_command(spec: &EmulateAttackSpec) -> String {
    format!(
        "for i in $(seq 1 {attempts}); do \
         sshpass -p wrong-password ssh -o StrictHostKeyChecking=no -o ConnectTimeout=3 \
         {account}@localhost true >/dev/null 2>&1 || true; done",
        attempts = spec.attempt_number,
        account = spec.target_account
    )
}

/// Probe for the auth-log trail the attack emulation leaves.
pub fn verify_attack_command(spec: &EmulateAttackSpec) -> String {
    format!(
        "grep -l 'Failed password for.*{}' /var/log/auth.log /var/log/secure 2>/dev/null | head -n1",
        spec.target_account
    )
}

/// Benign "malware" daemon: a busy loop parked under a recognizable name.
pub fn emulate_malware_commands(spec: &EmulateMalwareSpec) -> Vec<String> {
    vec![
        format!(
            "printf '#!/bin/sh\\nwhile true; do sleep 1; done\\n' > /usr/local/bin/{name} \
             && chmod +x /usr/local/bin/{name}",
            name = spec.name
        ),
        format!(
            "pgrep -f /usr/local/bin/{name} >/dev/null || \
             nohup /usr/local/bin/{name} >/dev/null 2>&1 &",
            name = spec.name
        ),
    ]
}

/// Probe for the running daemon.
pub fn verify_malware_command(spec: &EmulateMalwareSpec) -> String {
    format!("pgrep -f /usr/local/bin/{}", spec.name)
}

/// The tcpreplay invocation for a capture replay.
pub fn traffic_replay_command(spec: &TrafficCaptureSpec) -> String {
    format!("tcpreplay --intf1={} {}", spec.iface, spec.pcap_file)
}

/// Read an interface's transmit counter, for replay verification.
pub fn interface_counter_command(iface: &str) -> String {
    format!("cat /sys/class/net/{}/statistics/tx_packets", iface)
}

/// Executor: runs a guest's task list sequentially over SSH.
#[derive(Debug)]
pub struct TaskExecutor<'a> {
    ssh: &'a SshExecutor,
    command_timeout: Duration,
}

impl<'a> TaskExecutor<'a> {
    /// Executor dispatching over the given SSH transport.
    pub fn new(ssh: &'a SshExecutor) -> Self {
        Self {
            ssh,
            command_timeout: TASK_TIMEOUT,
        }
    }

    /// Run all tasks for one guest. `skip_build_time` is set for kvm-auto
    /// guests whose account tasks were already applied during image
    /// customization.
    pub fn run_tasks(
        &self,
        ctx: &OpContext,
        vm_name: &str,
        vm_ip: &str,
        ssh_user: &str,
        os_type: &str,
        tasks: &[Task],
        skip_build_time: bool,
    ) -> Vec<TaskResult> {
        let target = SshTarget::new(ssh_user, vm_ip);
        let mut results = Vec::new();

        for (index, task) in tasks.iter().enumerate() {
            if skip_build_time && task.is_build_time() && !task.also_runtime() {
                results.push(TaskResult::skipped(
                    task,
                    index,
                    vm_name,
                    vm_ip,
                    "applied at image build time",
                ));
                continue;
            }

            let result = self.run_one(ctx, &target, vm_name, vm_ip, os_type, index, task);
            let failed_fatally = !result.success && task.fatal();
            results.push(result);
            if failed_fatally {
                debug!(vm_name, index, "fatal task failed, aborting guest task list");
                break;
            }
        }
        results
    }

    fn run_one(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        vm_name: &str,
        vm_ip: &str,
        os_type: &str,
        index: usize,
        task: &Task,
    ) -> TaskResult {
        let started = Instant::now();
        let outcome = self.dispatch(ctx, target, os_type, task);

        let (success, message, output, error, evidence, verification_passed) = match outcome {
            Ok(o) => (
                o.success && o.verification_passed,
                o.message,
                o.output,
                o.error,
                o.evidence,
                o.verification_passed,
            ),
            Err(e) => (
                false,
                format!("{} failed", task.kind()),
                String::new(),
                Some(e.to_string()),
                None,
                false,
            ),
        };

        TaskResult {
            task_id: format!("{}:{}:{}", vm_name, index, task.kind()),
            task_type: task.kind().to_string(),
            vm_name: vm_name.to_string(),
            vm_ip: vm_ip.to_string(),
            success,
            message,
            elapsed_secs: started.elapsed().as_secs_f64(),
            output,
            error,
            evidence,
            verification_passed,
            timestamp: Utc::now(),
        }
    }

    fn dispatch(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        os_type: &str,
        task: &Task,
    ) -> Result<Outcome> {
        match task {
            Task::AddAccount(spec) => self.add_account(ctx, target, spec),
            Task::ModifyAccount(spec) => self.modify_account(ctx, target, spec),
            Task::InstallPackage(spec) => self.install_package(ctx, target, os_type, spec),
            Task::CopyContent(spec) => self.copy_content(ctx, target, spec),
            Task::ExecuteProgram(spec) => self.execute_program(ctx, target, spec),
            Task::EmulateAttack(spec) => self.emulate_attack(ctx, target, spec),
            Task::EmulateMalware(spec) => self.emulate_malware(ctx, target, spec),
            Task::EmulateTrafficCaptureFile(spec) => self.replay_traffic(ctx, target, spec),
            Task::FirewallRules(spec) => self.firewall_rules(ctx, target, spec),
        }
    }

    fn exec(&self, ctx: &OpContext, target: &SshTarget, command: &str) -> Result<SshOutput> {
        self.ssh
            .execute(ctx, target, command, Some(self.command_timeout), true)
    }

    fn add_account(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &AddAccountSpec,
    ) -> Result<Outcome> {
        let mut combined = String::new();
        for command in add_account_commands(spec) {
            let output = self.exec(ctx, target, &command)?;
            combined.push_str(&output.stdout);
            if !output.success() {
                return Ok(Outcome::failed(
                    format!("account setup command failed: {}", output.stderr.trim()),
                    combined,
                ));
            }
        }

        // Verify: the account resolves and carries the requested groups.
        let probe = self.exec(ctx, target, &format!("id {}", spec.account))?;
        let groups_ok = spec
            .groups
            .iter()
            .all(|group| probe.stdout.contains(group.as_str()));
        let verified = probe.success() && groups_ok;
        Ok(Outcome {
            success: true,
            verification_passed: verified,
            message: if verified {
                format!("account {} present", spec.account)
            } else {
                format!("account {} missing or lacks groups", spec.account)
            },
            output: combined,
            evidence: Some(probe.stdout.trim().to_string()),
            error: None,
        })
    }

    fn modify_account(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &ModifyAccountSpec,
    ) -> Result<Outcome> {
        let mut combined = String::new();
        for command in modify_account_commands(spec) {
            let output = self.exec(ctx, target, &command)?;
            combined.push_str(&output.stdout);
            if !output.success() {
                return Ok(Outcome::failed(
                    format!("account change failed: {}", output.stderr.trim()),
                    combined,
                ));
            }
        }

        // Verify by logging in with the new credentials.
        let account = spec.new_account.as_deref().unwrap_or(&spec.account);
        let verified = match spec.new_passwd {
            Some(ref new_passwd) => {
                let probe = crate::ssh_exec::SshExecutor::new(
                    &crate::config::Config::default(),
                    crate::ssh_exec::SshCredentials {
                        key_path: None,
                        password: Some(new_passwd.clone()),
                    },
                );
                let login = SshTarget::new(account, &target.host);
                probe
                    .execute(ctx, &login, "true", Some(Duration::from_secs(15)), false)
                    .map(|o| o.success())
                    .unwrap_or(false)
            }
            None => {
                let probe = self.exec(ctx, target, &format!("id {}", account))?;
                probe.success()
            }
        };
        Ok(Outcome {
            success: true,
            verification_passed: verified,
            message: format!("account {} updated", account),
            output: combined,
            evidence: Some(format!("login-as={} verified={}", account, verified)),
            error: None,
        })
    }

    fn install_package(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        os_type: &str,
        spec: &InstallPackageSpec,
    ) -> Result<Outcome> {
        let install = self.exec(ctx, target, &install_package_command(spec, os_type))?;
        if !install.success() {
            return Ok(Outcome::failed(
                format!("package install failed: {}", install.stderr.trim()),
                install.stdout,
            ));
        }
        let probe = self.exec(ctx, target, &verify_package_command(spec, os_type))?;
        Ok(Outcome {
            success: true,
            verification_passed: probe.success(),
            message: format!("package {} installed", spec.name),
            output: install.stdout,
            evidence: Some(probe.stdout.lines().next().unwrap_or("").to_string()),
            error: None,
        })
    }

    fn copy_content(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &CopyContentSpec,
    ) -> Result<Outcome> {
        let src = camino::Utf8Path::new(&spec.src);
        let dst = camino::Utf8Path::new(&spec.dst);
        self.ssh.put(ctx, target, src, dst)?;

        let mut evidence = format!("size+mtime verified for {}", dst);
        let mut verified = true;
        if spec.checksum {
            let local = local_sha256(src)?;
            let probe = self.exec(ctx, target, &format!("sha256sum {}", dst))?;
            let remote = probe
                .stdout
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            verified = probe.success() && remote == local;
            evidence = format!("sha256 local={} remote={}", local, remote);
        }
        Ok(Outcome {
            success: true,
            verification_passed: verified,
            message: format!("{} copied to {}", spec.src, spec.dst),
            output: String::new(),
            evidence: Some(evidence),
            error: None,
        })
    }

    fn execute_program(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &ExecuteProgramSpec,
    ) -> Result<Outcome> {
        let output = self.exec(ctx, target, &execute_program_command(spec))?;
        let mut verified = output.success();
        if verified {
            if let Some(ref pattern) = spec.expect_stdout {
                let re = Regex::new(pattern)
                    .map_err(|e| crate::errors::CyrisError::Task(format!("bad regex: {}", e)))?;
                verified = re.is_match(&output.stdout);
            }
        }
        Ok(Outcome {
            success: output.success(),
            verification_passed: verified,
            message: format!("{} exited {}", spec.program, output.exit_code),
            evidence: Some(format!("exit={}", output.exit_code)),
            error: if output.success() {
                None
            } else {
                Some(output.stderr.trim().to_string())
            },
            output: output.stdout,
        })
    }

    fn emulate_attack(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &EmulateAttackSpec,
    ) -> Result<Outcome> {
        if spec.attack_type != "ssh_attack" {
            return Ok(Outcome::failed(
                format!("unsupported attack_type {:?}", spec.attack_type),
                String::new(),
            ));
        }
        let run = self.exec(ctx, target, &emulate_attack_command(spec))?;
        let probe = self.exec(ctx, target, &verify_attack_command(spec))?;
        let verified = probe.success() && !probe.stdout.trim().is_empty();
        Ok(Outcome {
            success: run.success(),
            verification_passed: verified,
            message: format!(
                "{} failed logins against {}",
                spec.attempt_number, spec.target_account
            ),
            output: run.stdout,
            evidence: Some(probe.stdout.trim().to_string()),
            error: None,
        })
    }

    fn emulate_malware(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &EmulateMalwareSpec,
    ) -> Result<Outcome> {
        let mut combined = String::new();
        for command in emulate_malware_commands(spec) {
            let output = self.exec(ctx, target, &command)?;
            combined.push_str(&output.stdout);
            if !output.success() {
                return Ok(Outcome::failed(
                    format!("malware daemon setup failed: {}", output.stderr.trim()),
                    combined,
                ));
            }
        }
        let probe = self.exec(ctx, target, &verify_malware_command(spec))?;
        Ok(Outcome {
            success: true,
            verification_passed: probe.success(),
            message: format!("daemon {} running ({})", spec.name, spec.mode),
            output: combined,
            evidence: Some(format!("pid={}", probe.stdout.trim())),
            error: None,
        })
    }

    fn replay_traffic(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &TrafficCaptureSpec,
    ) -> Result<Outcome> {
        let before = self.exec(ctx, target, &interface_counter_command(&spec.iface))?;
        let replay = self.exec(ctx, target, &traffic_replay_command(spec))?;
        if !replay.success() {
            return Ok(Outcome::failed(
                format!("tcpreplay failed: {}", replay.stderr.trim()),
                replay.stdout,
            ));
        }
        let after = self.exec(ctx, target, &interface_counter_command(&spec.iface))?;
        let before_count: u64 = before.stdout.trim().parse().unwrap_or(0);
        let after_count: u64 = after.stdout.trim().parse().unwrap_or(0);
        Ok(Outcome {
            success: true,
            verification_passed: after_count > before_count,
            message: format!("replayed {} on {}", spec.pcap_file, spec.iface),
            output: replay.stdout,
            evidence: Some(format!("tx_packets {} -> {}", before_count, after_count)),
            error: None,
        })
    }

    fn firewall_rules(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        spec: &FirewallRulesSpec,
    ) -> Result<Outcome> {
        let local = camino::Utf8Path::new(&spec.rule_file);
        let remote = camino::Utf8PathBuf::from(format!(
            "/tmp/cyris-rules-{}",
            local.file_name().unwrap_or("rules")
        ));
        self.ssh.put(ctx, target, local, &remote)?;
        let apply = self.exec(ctx, target, &format!("iptables-restore < {}", remote))?;
        if !apply.success() {
            return Ok(Outcome::failed(
                format!("iptables-restore failed: {}", apply.stderr.trim()),
                apply.stdout,
            ));
        }

        // Verify: the active ruleset contains the expected rule lines.
        let expected = expected_rule_lines(&std::fs::read_to_string(local.as_std_path())?);
        let active = self.exec(ctx, target, "iptables-save")?;
        let verified = expected
            .iter()
            .all(|line| active.stdout.contains(line.as_str()));
        Ok(Outcome {
            success: true,
            verification_passed: verified,
            message: format!("applied rules from {}", spec.rule_file),
            output: apply.stdout,
            evidence: Some(format!("{} rule lines present", expected.len())),
            error: None,
        })
    }
}

struct Outcome {
    success: bool,
    verification_passed: bool,
    message: String,
    output: String,
    evidence: Option<String>,
    error: Option<String>,
}

impl Outcome {
    fn failed(message: String, output: String) -> Self {
        Self {
            success: false,
            verification_passed: false,
            message,
            output,
            evidence: None,
            error: None,
        }
    }
}

/// The rule lines of an iptables-restore file, stripped of tables,
/// comments and COMMIT markers.
pub fn expected_rule_lines(rule_file: &str) -> Vec<String> {
    rule_file
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('#')
                && !line.starts_with('*')
                && !line.starts_with(':')
                && *line != "COMMIT"
        })
        .map(str::to_string)
        .collect()
}

fn local_sha256(path: &camino::Utf8Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let content = std::fs::read(path.as_std_path())?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_entry_yaml_shape() {
        let yaml = r#"
- add_account: [{ account: trainee, passwd: t123, groups: [developers], sudo: yes }]
- install_package: [{ name: wireshark }, { name: nmap }]
- execute_program: [{ program: /opt/setup.sh, interpreter: bash, expect_stdout: "done" }]
"#;
        let entries: Vec<TaskEntry> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entries.len(), 3);

        let tasks = flatten(&entries);
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].kind(), "add_account");
        assert_eq!(tasks[1].kind(), "install_package");
        assert_eq!(tasks[2].kind(), "install_package");
        assert_eq!(tasks[3].kind(), "execute_program");

        match &tasks[0] {
            Task::AddAccount(spec) => {
                assert_eq!(spec.account, "trainee");
                assert!(spec.sudo);
                assert!(!spec.fatal);
                assert_eq!(spec.groups, vec!["developers".to_string()]);
            }
            other => panic!("unexpected task: {:?}", other),
        }
    }

    #[test]
    fn test_flatten_preserves_order() {
        let yaml = r#"
- copy_content: [{ src: /a, dst: /b }]
- add_account: [{ account: u1, passwd: p }, { account: u2, passwd: p }]
- firewall_rules: [{ rule_file: /etc/rules.v4 }]
"#;
        let entries: Vec<TaskEntry> = serde_yaml::from_str(yaml).unwrap();
        let kinds: Vec<&str> = flatten(&entries).iter().map(|t| t.kind()).collect();
        assert_eq!(
            kinds,
            vec!["copy_content", "add_account", "add_account", "firewall_rules"]
        );
    }

    #[test]
    fn test_build_time_classification() {
        let yaml = r#"
- add_account: [{ account: a, passwd: p }]
- modify_account: [{ account: a, new_passwd: q, also_runtime: yes }]
- install_package: [{ name: curl }]
"#;
        let entries: Vec<TaskEntry> = serde_yaml::from_str(yaml).unwrap();
        let tasks = flatten(&entries);
        assert!(tasks[0].is_build_time());
        assert!(!tasks[0].also_runtime());
        assert!(tasks[1].is_build_time());
        assert!(tasks[1].also_runtime());
        assert!(!tasks[2].is_build_time());
    }

    #[test]
    fn test_add_account_command_synthesis() {
        let spec = AddAccountSpec {
            account: "trainee".to_string(),
            passwd: "t123".to_string(),
            groups: vec!["developers".to_string(), "docker".to_string()],
            sudo: true,
            also_runtime: false,
            fatal: false,
        };
        let commands = add_account_commands(&spec);
        assert_eq!(commands.len(), 4);
        assert!(commands[0].contains("useradd -m -s /bin/bash trainee"));
        assert!(commands[0].contains("id trainee"));
        assert_eq!(commands[1], "echo 'trainee:t123' | chpasswd");
        assert_eq!(commands[2], "usermod -aG developers,docker trainee");
        assert!(commands[3].contains("usermod -aG sudo trainee"));
    }

    #[test]
    fn test_install_package_commands_per_manager() {
        let spec = InstallPackageSpec {
            name: "wireshark".to_string(),
            package_manager: None,
            version: None,
            fatal: false,
        };
        assert_eq!(
            install_package_command(&spec, "ubuntu_20"),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y wireshark"
        );
        assert_eq!(verify_package_command(&spec, "ubuntu_20"), "dpkg -s wireshark");
        assert_eq!(
            install_package_command(&spec, "centos_9"),
            "dnf install -y wireshark"
        );
        assert_eq!(verify_package_command(&spec, "centos_9"), "rpm -q wireshark");

        let pinned = InstallPackageSpec {
            name: "nmap".to_string(),
            package_manager: Some("apt-get".to_string()),
            version: Some("7.80".to_string()),
            fatal: false,
        };
        assert_eq!(
            install_package_command(&pinned, "ubuntu_20"),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y nmap=7.80"
        );
    }

    #[test]
    fn test_execute_program_command() {
        let spec = ExecuteProgramSpec {
            program: "/opt/run.py".to_string(),
            interpreter: Some("python3".to_string()),
            args: Some("--fast".to_string()),
            user: Some("trainee".to_string()),
            expect_stdout: None,
            fatal: false,
        };
        assert_eq!(
            execute_program_command(&spec),
            "sudo -u trainee python3 /opt/run.py --fast"
        );

        let bare = ExecuteProgramSpec {
            program: "/usr/bin/true".to_string(),
            interpreter: None,
            args: None,
            user: None,
            expect_stdout: None,
            fatal: false,
        };
        assert_eq!(execute_program_command(&bare), "/usr/bin/true");
    }

    #[test]
    fn test_attack_and_malware_synthesis() {
        let attack = EmulateAttackSpec {
            attack_type: "ssh_attack".to_string(),
            target_account: "trainee".to_string(),
            attempt_number: 5,
            fatal: false,
        };
        let command = emulate_attack_command(&attack);
        assert!(command.contains("seq 1 5"));
        assert!(command.contains("trainee@localhost"));
        assert!(verify_attack_command(&attack).contains("Failed password"));

        let malware = EmulateMalwareSpec {
            name: "cryptominer".to_string(),
            mode: "dummy_calculation".to_string(),
            fatal: false,
        };
        let commands = emulate_malware_commands(&malware);
        assert!(commands[0].contains("/usr/local/bin/cryptominer"));
        assert_eq!(
            verify_malware_command(&malware),
            "pgrep -f /usr/local/bin/cryptominer"
        );
    }

    #[test]
    fn test_expected_rule_lines() {
        let rules = r#"
# training firewall
*filter
:INPUT ACCEPT [0:0]
-A INPUT -p tcp --dport 22 -j ACCEPT
-A INPUT -p tcp --dport 80 -j ACCEPT
COMMIT
"#;
        let lines = expected_rule_lines(rules);
        assert_eq!(
            lines,
            vec![
                "-A INPUT -p tcp --dport 22 -j ACCEPT",
                "-A INPUT -p tcp --dport 80 -j ACCEPT"
            ]
        );
    }

    #[test]
    fn test_skip_all_marks_failures() {
        let tasks = vec![Task::InstallPackage(InstallPackageSpec {
            name: "curl".to_string(),
            package_manager: None,
            version: None,
            fatal: false,
        })];
        let results = skip_all(&tasks, "cyris-desktop-aaa", "guest never became reachable");
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(!results[0].verification_passed);
        assert!(results[0].message.contains("skipped"));
    }

    #[test]
    fn test_task_ordering_in_results_ids() {
        let yaml = r#"
- install_package: [{ name: a }, { name: b }]
- execute_program: [{ program: /x }]
"#;
        let entries: Vec<TaskEntry> = serde_yaml::from_str(yaml).unwrap();
        let tasks = flatten(&entries);
        let results = skip_all(&tasks, "vm", "unreachable");
        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["vm:0:install_package", "vm:1:install_package", "vm:2:execute_program"]
        );
    }
}
