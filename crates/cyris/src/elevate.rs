//! Privilege elevation for builder and host operations
//!
//! Image building and forwarding-rule application need root. Elevation is
//! acquired proactively, once per workflow, and cached for the sudo
//! timestamp lifetime. The primary method drives `sudo -v` on a real
//! pseudo-terminal so the password prompt behaves exactly as in a shell;
//! when sudo reports that no terminal is usable, a stdin fallback feeds a
//! password read from `/dev/tty` to `sudo -S`. When neither can work the
//! error spells out the available remediations for the detected
//! environment.

use color_eyre::{eyre::Context as _, Result};
use indoc::formatdoc;
use rustix::event::{PollFd, PollFlags};
use rustix::pty::OpenptFlags;
use rustix::termios::{OptionalActions, Termios};
use std::fs::File;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::CyrisError;
use crate::ledger::{Ledger, OpContext, OpKind, OperationRecord};

/// How long an acquired sudo timestamp is trusted.
pub const CACHE_VALIDITY: Duration = Duration::from_secs(15 * 60);

/// Output substrings that switch the PTY method to the stdin fallback.
/// These match sudo's own wording; keep them verbatim.
pub const FALLBACK_INDICATORS: [&str; 3] = [
    "terminal is required",
    "a password is required",
    "askpass helper",
];

/// The elevation method that ended up being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationMethod {
    /// `sudo -n` succeeded outright (NOPASSWD or warm timestamp).
    Passwordless,
    /// Interactive prompt on an allocated pseudo-terminal.
    Pty,
    /// Password read from /dev/tty and fed to `sudo -S`.
    StdinFallback,
}

impl ElevationMethod {
    /// Stable name recorded in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElevationMethod::Passwordless => "passwordless",
            ElevationMethod::Pty => "pty",
            ElevationMethod::StdinFallback => "stdin_fallback",
        }
    }
}

/// Execution context classification used to customize guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEnvironment {
    /// Remote session without a forced TTY
    SshWithoutTty,
    /// Local pipe, cron job or service unit
    LocalNonInteractive,
    /// Local terminal
    LocalInteractive,
}

/// Classify from observable facts; injected for testability.
pub fn classify_environment(stdin_is_tty: bool, over_ssh: bool) -> ExecutionEnvironment {
    match (stdin_is_tty, over_ssh) {
        (false, true) => ExecutionEnvironment::SshWithoutTty,
        (false, false) => ExecutionEnvironment::LocalNonInteractive,
        (true, _) => ExecutionEnvironment::LocalInteractive,
    }
}

/// Detect the current process environment.
pub fn detect_environment() -> ExecutionEnvironment {
    let stdin_is_tty = rustix::termios::isatty(rustix::stdio::stdin());
    let over_ssh =
        std::env::var_os("SSH_CONNECTION").is_some() || std::env::var_os("SSH_CLIENT").is_some();
    classify_environment(stdin_is_tty, over_ssh)
}

/// Whether combined sudo output demands the stdin fallback.
pub fn needs_fallback(merged_output: &str) -> bool {
    FALLBACK_INDICATORS
        .iter()
        .any(|needle| merged_output.contains(needle))
}

/// The ELEVATION error with environment-specific remediation lines.
pub fn guidance_error(environment: ExecutionEnvironment) -> CyrisError {
    let user = std::env::var("USER").unwrap_or_else(|_| "<user>".to_string());
    let first = match environment {
        ExecutionEnvironment::SshWithoutTty => {
            "Re-run with a forced TTY: ssh -t <host> cyris create <description>"
        }
        ExecutionEnvironment::LocalNonInteractive => {
            "Re-run from an interactive terminal (not from a pipe, cron job or service unit)"
        }
        ExecutionEnvironment::LocalInteractive => {
            "Re-run in this terminal and enter the password when prompted"
        }
    };
    let message = formatdoc! {"
        unable to acquire root privileges in this environment ({env:?}); one of the following is required:
          1. {first}
          2. Grant passwordless elevation: echo '{user} ALL=(ALL) NOPASSWD: ALL' | sudo tee /etc/sudoers.d/cyris
          3. Configure an askpass helper: export SUDO_ASKPASS=/usr/libexec/openssh/ssh-askpass",
        env = environment,
        first = first,
        user = user,
    };
    CyrisError::Elevation(message)
}

#[derive(Debug)]
struct CacheState {
    method: Option<ElevationMethod>,
    acquired_at: Option<Instant>,
}

/// Acquires and caches elevation; wraps privileged commands.
#[derive(Debug)]
pub struct PrivilegedExecutor {
    cache: Mutex<CacheState>,
}

impl PrivilegedExecutor {
    /// Executor with a cold elevation cache.
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(CacheState {
                method: None,
                acquired_at: None,
            }),
        }
    }

    /// The method that satisfied the last acquisition, if any.
    pub fn method(&self) -> Option<ElevationMethod> {
        self.cache.lock().expect("elevation cache poisoned").method
    }

    /// Whether a previous acquisition is still trusted.
    pub fn is_cached(&self) -> bool {
        let cache = self.cache.lock().expect("elevation cache poisoned");
        matches!(cache.acquired_at, Some(at) if at.elapsed() < CACHE_VALIDITY)
    }

    /// Proactively acquire elevation. Called once at workflow start,
    /// before any validation or long-running step.
    pub fn acquire(&self, ledger: &Ledger, range_id: Option<&str>) -> Result<ElevationMethod> {
        if self.is_cached() {
            let method = self.method().expect("cached without method");
            debug!("elevation still cached ({})", method.as_str());
            return Ok(method);
        }

        let environment = detect_environment();
        let started = Instant::now();

        // Cheapest first: NOPASSWD rules and warm sudo timestamps need no
        // interaction at all.
        let noninteractive = Command::new("sudo")
            .args(["-n", "-v"])
            .stdin(Stdio::null())
            .output()
            .context("Failed to spawn sudo")?;
        if noninteractive.status.success() {
            return Ok(self.remember(
                ledger,
                range_id,
                ElevationMethod::Passwordless,
                started,
            ));
        }

        let merged = merge_output(&noninteractive.stdout, &noninteractive.stderr);
        if environment == ExecutionEnvironment::LocalInteractive {
            // Primary method: interactive prompt on a fresh PTY.
            match run_on_pty(&["sudo", "-v"]) {
                Ok(pty_result) if pty_result.exit_code == 0 => {
                    return Ok(self.remember(ledger, range_id, ElevationMethod::Pty, started));
                }
                Ok(pty_result) if needs_fallback(&pty_result.output) => {
                    debug!("pty method asked for fallback");
                }
                Ok(pty_result) => {
                    return Err(CyrisError::Elevation(format!(
                        "sudo refused the password (exit {})",
                        pty_result.exit_code
                    ))
                    .into());
                }
                Err(e) => debug!("pty method unavailable: {e}"),
            }

            // Automatic fallback: password over stdin.
            if let Ok(method) = self.stdin_fallback() {
                return Ok(self.remember(ledger, range_id, method, started));
            }
        } else if needs_fallback(&merged) {
            // No usable terminal for the primary method, but sudo says a
            // password would be accepted; /dev/tty may still exist.
            if let Ok(method) = self.stdin_fallback() {
                return Ok(self.remember(ledger, range_id, method, started));
            }
        }

        Err(guidance_error(environment).into())
    }

    /// Stdin fallback: read the password from the controlling terminal and
    /// feed it to `sudo -S -v`.
    fn stdin_fallback(&self) -> Result<ElevationMethod> {
        let password = dialoguer::Password::new()
            .with_prompt("[sudo] password")
            .interact()
            .map_err(|e| CyrisError::Elevation(format!("cannot prompt for password: {}", e)))?;

        let mut child = Command::new("sudo")
            .args(["-S", "-v"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn sudo -S")?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = writeln!(stdin, "{}", password);
        }
        let output = child
            .wait_with_output()
            .context("Failed to wait for sudo -S")?;
        if !output.status.success() {
            return Err(CyrisError::Elevation("sudo rejected the password".into()).into());
        }
        Ok(ElevationMethod::StdinFallback)
    }

    fn remember(
        &self,
        ledger: &Ledger,
        range_id: Option<&str>,
        method: ElevationMethod,
        started: Instant,
    ) -> ElevationMethod {
        {
            let mut cache = self.cache.lock().expect("elevation cache poisoned");
            cache.method = Some(method);
            cache.acquired_at = Some(Instant::now());
        }
        let mut ctx = OpContext::new("elevation");
        ctx.range_id = range_id.map(str::to_string);
        ledger.append(OperationRecord {
            seq: 0,
            timestamp: chrono::Utc::now(),
            kind: OpKind::Shell,
            command: format!("sudo -v [method={}]", method.as_str()),
            context: ctx,
            exit_code: 0,
            elapsed_secs: started.elapsed().as_secs_f64(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            ignored: false,
        });
        ledger.log_line(
            range_id,
            &format!("Privileges acquired (method={})", method.as_str()),
        );
        method
    }

    /// Wrap a command line so it runs elevated; acquisition must have
    /// happened first, so `-n` never prompts.
    pub fn wrap(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg(program).args(args);
        cmd
    }
}

impl Default for PrivilegedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut merged = String::from_utf8_lossy(stdout).into_owned();
    merged.push_str(&String::from_utf8_lossy(stderr));
    merged
}

/// Outcome of a PTY-driven command.
#[derive(Debug)]
pub struct PtyResult {
    /// Child exit code
    pub exit_code: i32,
    /// Everything the child wrote to the terminal
    pub output: String,
}

/// Saved terminal attributes, restored on drop so every exit path (early
/// return, error, panic unwind) leaves the terminal usable.
struct TermGuard {
    saved: Option<Termios>,
}

impl TermGuard {
    fn raw_stdin() -> Self {
        let stdin = rustix::stdio::stdin();
        if !rustix::termios::isatty(stdin) {
            return Self { saved: None };
        }
        match rustix::termios::tcgetattr(stdin) {
            Ok(saved) => {
                let mut raw = saved.clone();
                raw.make_raw();
                let _ = rustix::termios::tcsetattr(stdin, OptionalActions::Now, &raw);
                Self { saved: Some(saved) }
            }
            Err(_) => Self { saved: None },
        }
    }
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let _ = rustix::termios::tcsetattr(
                rustix::stdio::stdin(),
                OptionalActions::Now,
                &saved,
            );
        }
    }
}

/// Run a command with a freshly allocated controlling pseudo-terminal,
/// forwarding the caller's stdin to the PTY master and echoing the PTY
/// output to the caller's stdout, while also capturing it for the
/// fallback indicator scan.
pub fn run_on_pty(argv: &[&str]) -> Result<PtyResult> {
    let master = rustix::pty::openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY)
        .context("Failed to open pty master")?;
    rustix::pty::grantpt(&master).context("Failed to grant pty")?;
    rustix::pty::unlockpt(&master).context("Failed to unlock pty")?;
    let slave_name = rustix::pty::ptsname(&master, Vec::new()).context("Failed to name pty")?;
    let slave_path = slave_name
        .into_string()
        .map_err(|_| CyrisError::Elevation("pty name is not UTF-8".into()))?;

    let slave = File::options()
        .read(true)
        .write(true)
        .open(&slave_path)
        .with_context(|| format!("Failed to open pty slave {}", slave_path))?;

    // setsid --ctty makes the slave the controlling terminal of a new
    // session without requiring fork hooks.
    let mut child = Command::new("setsid")
        .arg("--ctty")
        .args(argv)
        .stdin(Stdio::from(slave.try_clone().context("clone pty slave")?))
        .stdout(Stdio::from(slave.try_clone().context("clone pty slave")?))
        .stderr(Stdio::from(slave))
        .spawn()
        .context("Failed to spawn on pty (is setsid installed?)")?;

    let _guard = TermGuard::raw_stdin();
    let stdin = rustix::stdio::stdin();
    let mut captured = String::new();
    let mut buf = [0u8; 1024];

    let exit_code = loop {
        if let Some(status) = child.try_wait().context("Failed to poll pty child")? {
            break status.code().unwrap_or(-1);
        }

        let mut fds = [
            PollFd::new(&master, PollFlags::IN),
            PollFd::new(&stdin, PollFlags::IN),
        ];
        const POLL_TICK: rustix::event::Timespec = rustix::event::Timespec {
            tv_sec: 0,
            tv_nsec: 100_000_000,
        };
        let _ = rustix::event::poll(&mut fds, Some(&POLL_TICK));

        if fds[0].revents().contains(PollFlags::IN) {
            if let Ok(n) = rustix::io::read(&master, &mut buf[..]) {
                if n > 0 {
                    captured.push_str(&String::from_utf8_lossy(&buf[..n]));
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(&buf[..n]);
                    let _ = stdout.flush();
                }
            }
        }
        if fds[1].revents().contains(PollFlags::IN) {
            if let Ok(n) = rustix::io::read(&stdin, &mut buf[..]) {
                if n > 0 {
                    let _ = rustix::io::write(&master, &buf[..n]);
                }
            }
        }
    };

    // Drain whatever the child wrote between the last poll and exit.
    while let Ok(n) = rustix::io::read(&master, &mut buf[..]) {
        if n == 0 {
            break;
        }
        captured.push_str(&String::from_utf8_lossy(&buf[..n]));
    }

    Ok(PtyResult {
        exit_code,
        output: captured,
    })
}
