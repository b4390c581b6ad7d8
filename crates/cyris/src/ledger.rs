//! Operation registry and per-range audit logging
//!
//! Every external side effect (shell command, SSH call, hypervisor
//! mutation, file transfer, builder invocation) is funneled through
//! [`Ledger::run_logged`]. The ledger keeps a process-global, append-only,
//! `seq`-ordered record list plus one `creation.log` appender per range.
//! Success of a range creation is decided by [`aggregate`] over the
//! records, never by ad-hoc flags.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::errors::{CyrisError, ErrorKind};

/// Number of trailing output characters kept in a record.
const OUTPUT_TAIL: usize = 2000;

/// Category of a recorded side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Local host command
    Shell,
    /// Remote command over SSH
    Ssh,
    /// Domain or network mutation
    Hypervisor,
    /// File transfer
    File,
    /// Image builder or customizer invocation
    Builder,
}

impl OpKind {
    /// Default failure classification for this category.
    fn fail_kind(&self) -> ErrorKind {
        match self {
            OpKind::Shell => ErrorKind::Resource,
            OpKind::Ssh => ErrorKind::Ssh,
            OpKind::Hypervisor => ErrorKind::Hypervisor,
            OpKind::File => ErrorKind::Resource,
            OpKind::Builder => ErrorKind::Environment,
        }
    }
}

/// Where an operation ran, for audit purposes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpContext {
    /// Range the operation belongs to
    pub range_id: Option<String>,
    /// Cloned guest the operation targets
    pub guest_id: Option<String>,
    /// Workflow phase name
    pub phase: String,
    /// Non-zero exit is acceptable for this call
    #[serde(skip)]
    pub ignore_errors: bool,
    /// Error kind override used when the operation fails
    #[serde(skip)]
    pub fail_kind: Option<ErrorKindTag>,
}

/// Serializable stand-in for [`ErrorKind`] overrides.
pub type ErrorKindTag = ErrorKind;

impl OpContext {
    /// Context for an operation outside any range.
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Default::default()
        }
    }

    /// Context for an operation of one range.
    pub fn for_range(phase: &str, range_id: &str) -> Self {
        Self {
            range_id: Some(range_id.to_string()),
            phase: phase.to_string(),
            ..Default::default()
        }
    }

    /// Attach the targeted guest.
    pub fn with_guest(mut self, guest_id: &str) -> Self {
        self.guest_id = Some(guest_id.to_string());
        self
    }

    /// Declare non-zero exits acceptable.
    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Override the error kind raised when the operation fails.
    pub fn failing_as(mut self, kind: ErrorKind) -> Self {
        self.fail_kind = Some(kind);
        self
    }
}

/// One entry in the append-only operation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Global sequence number, assigned at append
    pub seq: u64,
    /// Wall-clock time of the append
    pub timestamp: DateTime<Utc>,
    /// Operation category
    pub kind: OpKind,
    /// Redacted command line
    pub command: String,
    /// Where the operation ran
    pub context: OpContext,
    /// Process exit code (-1 when killed by signal)
    pub exit_code: i32,
    /// Runtime in seconds
    pub elapsed_secs: f64,
    /// Trailing stdout
    pub stdout_tail: String,
    /// Trailing stderr
    pub stderr_tail: String,
    /// Whether a non-zero exit was declared acceptable by the caller.
    pub ignored: bool,
}

/// Aggregated view over one range's slice of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    /// Records attributed to the range
    pub total: usize,
    /// Non-ignored records with non-zero exit
    pub failures: usize,
}

impl LedgerSummary {
    /// Whether the range's operations all succeeded.
    pub fn success(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug)]
struct LedgerInner {
    seq: u64,
    records: Vec<OperationRecord>,
    log_files: HashMap<String, File>,
    base_dir: Option<Utf8PathBuf>,
}

/// The operation registry. One global instance exists per process; tests
/// construct their own.
#[derive(Debug)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

static GLOBAL: OnceLock<Ledger> = OnceLock::new();

impl Ledger {
    /// An empty ledger with no log directory attached.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                seq: 0,
                records: Vec::new(),
                log_files: HashMap::new(),
                base_dir: None,
            }),
        }
    }

    /// The process-wide ledger, created on first use.
    pub fn global() -> &'static Ledger {
        GLOBAL.get_or_init(Ledger::new)
    }

    /// Point per-range log files at `<base>/<range_id>/creation.log`.
    /// Called once at workflow start; appends before this go only to the
    /// in-memory ledger.
    pub fn set_base_dir(&self, base: &Utf8Path) {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        inner.base_dir = Some(base.to_owned());
    }

    /// Run a command, capture its output and append a record. Raises a
    /// classified error on non-zero exit unless the context says
    /// `ignore_errors`.
    pub fn run_logged(&self, cmd: &mut Command, kind: OpKind, ctx: &OpContext) -> Result<std::process::Output> {
        let command_line = render_command(cmd);
        let redacted = redact(&command_line);
        self.log_line(
            ctx.range_id.as_deref(),
            &format!("[{}] {}: {}", kind_label(kind), ctx.phase, redacted),
        );

        let start = Instant::now();
        let output = cmd
            .output()
            .with_context(|| format!("Failed to spawn: {}", redacted))?;
        let elapsed = start.elapsed().as_secs_f64();
        let exit_code = output.status.code().unwrap_or(-1);

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stdout.trim().is_empty() {
            self.log_line(ctx.range_id.as_deref(), stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            self.log_line(ctx.range_id.as_deref(), stderr.trim_end());
        }

        let record = OperationRecord {
            seq: 0, // assigned under the lock
            timestamp: Utc::now(),
            kind,
            command: redacted.clone(),
            context: ctx.clone(),
            exit_code,
            elapsed_secs: elapsed,
            stdout_tail: tail(&stdout),
            stderr_tail: tail(&stderr),
            ignored: ctx.ignore_errors,
        };
        self.append(record);

        if exit_code != 0 && !ctx.ignore_errors {
            let kind = ctx.fail_kind.unwrap_or_else(|| kind.fail_kind());
            let message = format!(
                "{} (exit {}): {}",
                redacted,
                exit_code,
                stderr.trim().lines().last().unwrap_or("")
            );
            return Err(classified(kind, message));
        }

        debug!(exit_code, elapsed, "{}", redacted);
        Ok(output)
    }

    /// Append an externally produced record (used by executors that manage
    /// their own process, e.g. the PTY path of the privileged executor).
    pub fn append(&self, mut record: OperationRecord) {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        inner.seq += 1;
        record.seq = inner.seq;
        inner.records.push(record);
    }

    /// Write one free-form line to a range's creation.log (and the debug
    /// log). Flushes immediately.
    pub fn log_line(&self, range_id: Option<&str>, line: &str) {
        debug!(range = range_id.unwrap_or("-"), "{}", line);
        let Some(range_id) = range_id else { return };
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let Some(base) = inner.base_dir.clone() else {
            return;
        };
        if !inner.log_files.contains_key(range_id) {
            let dir = base.join(range_id);
            if fs::create_dir_all(&dir).is_err() {
                return;
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("creation.log"))
            {
                Ok(file) => {
                    inner.log_files.insert(range_id.to_string(), file);
                }
                Err(_) => return,
            }
        }
        if let Some(file) = inner.log_files.get_mut(range_id) {
            let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "{} {}", stamp, line);
            let _ = file.flush();
        }
    }

    /// Aggregate success/failure for one range. A failure is any record
    /// with non-zero exit that was not declared ignorable.
    pub fn aggregate(&self, range_id: &str) -> LedgerSummary {
        let inner = self.inner.lock().expect("ledger poisoned");
        summarize(&inner.records, range_id)
    }

    /// Snapshot of the records for one range, in seq order.
    pub fn records_for(&self, range_id: &str) -> Vec<OperationRecord> {
        let inner = self.inner.lock().expect("ledger poisoned");
        inner
            .records
            .iter()
            .filter(|r| r.context.range_id.as_deref() == Some(range_id))
            .cloned()
            .collect()
    }

    /// Close a range's log file handle (workflow end).
    pub fn close_range(&self, range_id: &str) {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        inner.log_files.remove(range_id);
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure aggregation over a record slice.
pub fn summarize(records: &[OperationRecord], range_id: &str) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for record in records {
        if record.context.range_id.as_deref() != Some(range_id) {
            continue;
        }
        summary.total += 1;
        if record.exit_code != 0 && !record.ignored {
            summary.failures += 1;
        }
    }
    summary
}

/// Write the `status` sidecar file for a range.
pub fn write_status_file(range_dir: &Utf8Path, success: bool) -> Result<()> {
    let content = if success { "SUCCESS\n" } else { "FAILURE\n" };
    fs::create_dir_all(range_dir)
        .with_context(|| format!("Failed to create range directory {}", range_dir))?;
    fs::write(range_dir.join("status"), content)
        .with_context(|| format!("Failed to write status file under {}", range_dir))
}

fn classified(kind: ErrorKind, message: String) -> color_eyre::Report {
    let err = match kind {
        ErrorKind::Config => CyrisError::Config(message),
        ErrorKind::Environment => CyrisError::Environment(message),
        ErrorKind::Elevation => CyrisError::Elevation(message),
        ErrorKind::Hypervisor => CyrisError::Hypervisor(message),
        ErrorKind::Network => CyrisError::Network(message),
        ErrorKind::Ssh => CyrisError::Ssh(message),
        ErrorKind::Task => CyrisError::Task(message),
        ErrorKind::Resource => CyrisError::Resource(message),
    };
    err.into()
}

fn kind_label(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Shell => "shell",
        OpKind::Ssh => "ssh",
        OpKind::Hypervisor => "hypervisor",
        OpKind::File => "file",
        OpKind::Builder => "builder",
    }
}

fn render_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Strip obvious credentials from a command line before it reaches the
/// ledger or the log file.
pub fn redact(command: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut mask_next = false;
    for token in command.split(' ') {
        if mask_next {
            out.push("****".to_string());
            mask_next = false;
            continue;
        }
        let lowered = token.to_ascii_lowercase();
        if let Some((key, _)) = token.split_once(['=', ':']) {
            let key = key.to_ascii_lowercase();
            if key.contains("passwd") || key.contains("password") {
                out.push(format!("{}=****", key));
                continue;
            }
        }
        if lowered == "-p" || lowered == "--password" || lowered == "--passwd" {
            mask_next = true;
            out.push(token.to_string());
            continue;
        }
        out.push(token.to_string());
    }
    out.join(" ")
}

fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL {
        return text.to_string();
    }
    let start = text.len() - OUTPUT_TAIL;
    // Avoid splitting a UTF-8 sequence
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(start);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(range: &str, exit_code: i32, ignored: bool) -> OperationRecord {
        OperationRecord {
            seq: 0,
            timestamp: Utc::now(),
            kind: OpKind::Shell,
            command: "true".to_string(),
            context: OpContext::for_range("test", range),
            exit_code,
            elapsed_secs: 0.0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            ignored,
        }
    }

    #[test]
    fn test_seq_is_monotonic() {
        let ledger = Ledger::new();
        for _ in 0..5 {
            ledger.append(record("r1", 0, false));
        }
        let records = ledger.records_for("r1");
        assert_eq!(records.len(), 5);
        for window in records.windows(2) {
            assert!(window[1].seq > window[0].seq);
        }
    }

    #[test]
    fn test_aggregate_counts_only_unignored_failures() {
        let ledger = Ledger::new();
        ledger.append(record("r1", 0, false));
        ledger.append(record("r1", 1, true));
        ledger.append(record("r1", 0, false));
        ledger.append(record("r2", 1, false));

        let summary = ledger.aggregate("r1");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failures, 0);
        assert!(summary.success());

        let summary = ledger.aggregate("r2");
        assert_eq!(summary.failures, 1);
        assert!(!summary.success());
    }

    #[test]
    fn test_run_logged_success_and_failure() {
        let ledger = Ledger::new();
        let ctx = OpContext::for_range("probe", "r1");

        let output = ledger
            .run_logged(&mut Command::new("true"), OpKind::Shell, &ctx)
            .unwrap();
        assert!(output.status.success());

        let err = ledger
            .run_logged(&mut Command::new("false"), OpKind::Shell, &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("exit 1"), "{err}");

        // Declared ignorable: no error, but still recorded
        let ctx = ctx.ignoring_errors();
        ledger
            .run_logged(&mut Command::new("false"), OpKind::Shell, &ctx)
            .unwrap();

        let summary = ledger.aggregate("r1");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failures, 1);
    }

    #[test]
    fn test_creation_log_written() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let ledger = Ledger::new();
        ledger.set_base_dir(base);
        ledger.log_line(Some("r9"), "hello from the workflow");
        ledger.close_range("r9");

        let content = fs::read_to_string(base.join("r9").join("creation.log")).unwrap();
        assert!(content.contains("hello from the workflow"));
    }

    #[test]
    fn test_redaction() {
        assert_eq!(
            redact("useradd trainee passwd:t123"),
            "useradd trainee passwd=****"
        );
        assert_eq!(
            redact("sshpass -p secret ssh host true"),
            "sshpass -p **** ssh host true"
        );
        assert_eq!(
            redact("echo password=hunter2"),
            "echo password=****"
        );
        assert_eq!(redact("virsh list --all"), "virsh list --all");
    }

    #[test]
    fn test_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap().join("r1");
        write_status_file(&base, true).unwrap();
        assert_eq!(fs::read_to_string(base.join("status")).unwrap(), "SUCCESS\n");
        write_status_file(&base, false).unwrap();
        assert_eq!(fs::read_to_string(base.join("status")).unwrap(), "FAILURE\n");
    }

    #[test]
    fn test_output_tail() {
        let long = "x".repeat(OUTPUT_TAIL + 100);
        assert_eq!(tail(&long).len(), OUTPUT_TAIL);
        assert_eq!(tail("short"), "short");
    }
}
