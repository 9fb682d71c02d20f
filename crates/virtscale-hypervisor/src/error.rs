//! Hypervisor error types.

use thiserror::Error;

/// Errors surfaced by hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The hypervisor could not be reached at all.
    #[error("failed to reach hypervisor: {0}")]
    Connection(String),

    /// The named domain, network, or volume does not exist (or is already
    /// stopped, for stop-like operations).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was attempted and rejected.
    #[error("{op} failed: {detail}")]
    CommandFailed { op: &'static str, detail: String },

    /// The transport itself failed to execute.
    #[error("failed to run virsh: {0}")]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    /// Whether this error means the target was already gone. Destroy paths
    /// treat these as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected() {
        assert!(HypervisorError::NotFound("domain vsd-1".into()).is_not_found());
        assert!(
            !HypervisorError::CommandFailed {
                op: "start",
                detail: "busy".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn display_includes_operation() {
        let err = HypervisorError::CommandFailed {
            op: "vol-create-as",
            detail: "pool exhausted".into(),
        };
        assert_eq!(err.to_string(), "vol-create-as failed: pool exhausted");
    }
}
