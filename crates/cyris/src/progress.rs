//! User-visible progress reporting
//!
//! The orchestrator emits phase/step notifications; a reporter renders
//! them. Reporters never decide control flow. Two implementations exist:
//! the plain reporter prints the legacy `* INFO: cyris:` lines, the rich
//! reporter drives an indicatif spinner in interactive terminals.

use camino::Utf8Path;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Rendering sink for orchestrator notifications.
pub trait ProgressReporter: Send + Sync {
    /// A workflow phase begins.
    fn start_phase(&self, name: &str);
    /// Progress within the current phase.
    fn step(&self, message: &str);
    /// An error happened; point the user at the log file.
    fn report_error(&self, context: &str, log_path: &Utf8Path);
    /// The workflow ended.
    fn finish(&self, success: bool, elapsed: Duration);
}

/// Pick a reporter for the current terminal: rich when stderr is a TTY
/// and verbose output was not requested, plain otherwise.
pub fn auto(verbose: bool) -> Box<dyn ProgressReporter> {
    if !verbose && stderr_is_tty() {
        Box::new(RichReporter::new())
    } else {
        Box::new(PlainReporter)
    }
}

fn stderr_is_tty() -> bool {
    rustix::termios::isatty(rustix::stdio::stderr())
}

/// Legacy line-per-message reporter.
#[derive(Debug)]
pub struct PlainReporter;

impl ProgressReporter for PlainReporter {
    fn start_phase(&self, name: &str) {
        eprintln!("* INFO: cyris: {}", name);
    }

    fn step(&self, message: &str) {
        eprintln!("* INFO: cyris: {}", message);
    }

    fn report_error(&self, context: &str, log_path: &Utf8Path) {
        eprintln!("* ERROR: cyris: {}", context);
        eprintln!("* ERROR: cyris: Check the log file for details: {}", log_path);
    }

    fn finish(&self, success: bool, elapsed: Duration) {
        let verdict = if success { "SUCCESS" } else { "FAILURE" };
        eprintln!(
            "* INFO: cyris: Creation result: {} (took {:.1}s)",
            verdict,
            elapsed.as_secs_f64()
        );
    }
}

/// Spinner-based reporter for interactive use.
pub struct RichReporter {
    bar: Mutex<ProgressBar>,
}

impl std::fmt::Debug for RichReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RichReporter").finish_non_exhaustive()
    }
}

impl RichReporter {
    /// Reporter with a freshly spun-up spinner.
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {prefix:.bold} {wide_msg}")
                .expect("static template"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar: Mutex::new(bar),
        }
    }
}

impl Default for RichReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for RichReporter {
    fn start_phase(&self, name: &str) {
        let bar = self.bar.lock().expect("reporter poisoned");
        bar.set_prefix(name.to_string());
        bar.set_message(String::new());
    }

    fn step(&self, message: &str) {
        let bar = self.bar.lock().expect("reporter poisoned");
        bar.set_message(message.to_string());
    }

    fn report_error(&self, context: &str, log_path: &Utf8Path) {
        let bar = self.bar.lock().expect("reporter poisoned");
        bar.println(format!("* ERROR: cyris: {}", context));
        bar.println(format!(
            "* ERROR: cyris: Check the log file for details: {}",
            log_path
        ));
    }

    fn finish(&self, success: bool, elapsed: Duration) {
        let bar = self.bar.lock().expect("reporter poisoned");
        let verdict = if success { "SUCCESS" } else { "FAILURE" };
        bar.finish_with_message(format!(
            "Creation result: {} (took {:.1}s)",
            verdict,
            elapsed.as_secs_f64()
        ));
    }
}

/// Reporter that records messages for assertions.
#[cfg(test)]
#[derive(Debug)]
pub struct RecordingReporter {
    /// Everything reported so far, one line per call
    pub lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingReporter {
    /// An empty recorder.
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn start_phase(&self, name: &str) {
        self.lines.lock().unwrap().push(format!("phase: {}", name));
    }

    fn step(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("step: {}", message));
    }

    fn report_error(&self, context: &str, log_path: &Utf8Path) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("error: {} ({})", context, log_path));
    }

    fn finish(&self, success: bool, elapsed: Duration) {
        self.lines.lock().unwrap().push(format!(
            "finish: {} {:.1}",
            success,
            elapsed.as_secs_f64()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_reporter_order() {
        let reporter = RecordingReporter::new();
        reporter.start_phase("Base images");
        reporter.step("building ubuntu-20.04");
        reporter.finish(true, Duration::from_secs(3));

        let lines = reporter.lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "phase: Base images");
        assert_eq!(lines[1], "step: building ubuntu-20.04");
        assert_eq!(lines[2], "finish: true 3.0");
    }
}
