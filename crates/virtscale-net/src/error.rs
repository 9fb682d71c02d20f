//! Networking error types.

use std::net::Ipv4Addr;

use thiserror::Error;
use virtscale_hypervisor::HypervisorError;

/// Errors raised by address allocation and network provisioning.
#[derive(Debug, Error)]
pub enum NetError {
    /// Every usable host address in the subnet is held by a live instance.
    /// Retryable once instances are freed.
    #[error("address space exhausted in subnet {subnet}/24")]
    AddressSpaceExhausted { subnet: Ipv4Addr },

    /// The hypervisor rejected a network operation. Fatal at startup.
    #[error("network setup failed: {0}")]
    Setup(#[from] HypervisorError),
}
