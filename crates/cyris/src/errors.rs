//! Error taxonomy for cyber range operations
//!
//! Every failure in the orchestrator is classified into one of the kinds
//! below so that the workflow can decide between local retry, step rollback
//! and full abort. The kind survives inside a `color_eyre::Report` and can
//! be recovered with [`classify_report`].

use thiserror::Error;

/// Classified failure raised by orchestrator components.
#[derive(Debug, Clone, Error)]
pub enum CyrisError {
    /// Invalid YAML, bad field value, out-of-range resource request.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing external tool, no KVM, unwritable directories.
    #[error("environment error: {0}")]
    Environment(String),

    /// Privilege elevation unavailable after primary and fallback methods.
    #[error("elevation error: {0}")]
    Elevation(String),

    /// Domain define/start/undefine or other hypervisor mutation failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// Bridge creation or forwarding rule application failed.
    #[error("network error: {0}")]
    Network(String),

    /// SSH transport or authentication failure after retries.
    #[error("ssh error: {0}")]
    Ssh(String),

    /// Guest task execution or verification failure.
    #[error("task error: {0}")]
    Task(String),

    /// Disk full, lock contention, inventory corruption.
    #[error("resource error: {0}")]
    Resource(String),
}

/// Discriminant of [`CyrisError`], used for policy decisions and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or description
    Config,
    /// Missing external tool or capability
    Environment,
    /// Privilege elevation unavailable
    Elevation,
    /// Hypervisor mutation failure
    Hypervisor,
    /// Bridge or forwarding-rule failure
    Network,
    /// SSH transport or authentication failure
    Ssh,
    /// Guest task failure
    Task,
    /// Disk, lock or inventory failure
    Resource,
}

impl CyrisError {
    /// The discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CyrisError::Config(_) => ErrorKind::Config,
            CyrisError::Environment(_) => ErrorKind::Environment,
            CyrisError::Elevation(_) => ErrorKind::Elevation,
            CyrisError::Hypervisor(_) => ErrorKind::Hypervisor,
            CyrisError::Network(_) => ErrorKind::Network,
            CyrisError::Ssh(_) => ErrorKind::Ssh,
            CyrisError::Task(_) => ErrorKind::Task,
            CyrisError::Resource(_) => ErrorKind::Resource,
        }
    }

    /// Structural failures abort the create workflow and trigger rollback;
    /// the remaining kinds are handled where they occur.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Environment | ErrorKind::Elevation
        )
    }
}

impl ErrorKind {
    /// Whether a failure of this kind is worth a local retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Ssh | ErrorKind::Hypervisor)
    }
}

/// Recover the classified kind from an eyre report, if one was attached.
pub fn classify_report(report: &color_eyre::Report) -> Option<ErrorKind> {
    report.downcast_ref::<CyrisError>().map(|e| e.kind())
}

/// Process exit code for a failed command per the CLI contract:
/// 1 for validation/usage errors, 3 for everything else.
pub fn exit_code_for(report: &color_eyre::Report) -> i32 {
    match classify_report(report) {
        Some(ErrorKind::Config) => 1,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CyrisError::Config("bad".into()).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            CyrisError::Network("bridge".into()).kind(),
            ErrorKind::Network
        );
        assert!(CyrisError::Elevation("no tty".into()).is_structural());
        assert!(!CyrisError::Task("verify".into()).is_structural());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Ssh.is_transient());
        assert!(ErrorKind::Hypervisor.is_transient());
        assert!(!ErrorKind::Config.is_transient());
        assert!(!ErrorKind::Network.is_transient());
    }

    #[test]
    fn test_classify_report() {
        let report = color_eyre::Report::new(CyrisError::Ssh("auth".into()));
        assert_eq!(classify_report(&report), Some(ErrorKind::Ssh));
        assert_eq!(exit_code_for(&report), 3);

        let report = color_eyre::Report::new(CyrisError::Config("field".into()));
        assert_eq!(exit_code_for(&report), 1);

        let plain = color_eyre::eyre::eyre!("unclassified");
        assert_eq!(classify_report(&plain), None);
        assert_eq!(exit_code_for(&plain), 3);
    }
}
