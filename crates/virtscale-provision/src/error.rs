//! Provisioning error types.

use thiserror::Error;
use virtscale_hypervisor::HypervisorError;
use virtscale_net::NetError;

/// Errors raised while bringing an instance up. A failed provision has
/// already cleaned up its partial artifacts by the time this surfaces;
/// the reconciler retries on its next pass.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid domain spec: {0}")]
    InvalidSpec(String),

    /// Address allocation failed (the subnet may be exhausted).
    #[error(transparent)]
    Address(#[from] NetError),

    #[error("{stage} failed for instance {id}: {source}")]
    Hypervisor {
        id: String,
        stage: &'static str,
        source: HypervisorError,
    },

    #[error("failed to write guest artifacts for instance {id}: {source}")]
    Artifacts {
        id: String,
        source: std::io::Error,
    },
}

/// Errors raised while tearing an instance down. Non-fatal to the caller:
/// the instance stays `Terminating` and destruction is retried.
#[derive(Debug, Error)]
pub enum DestroyError {
    #[error("{stage} failed for instance {id}: {source}")]
    Hypervisor {
        id: String,
        stage: &'static str,
        source: HypervisorError,
    },
}
