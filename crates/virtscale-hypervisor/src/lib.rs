//! virtscale-hypervisor — the hypervisor interface boundary.
//!
//! The daemon only depends on a small set of operation semantics: define
//! and start domains, create and delete volumes, define and destroy the
//! virtual network, and list domains by name prefix. The [`Hypervisor`]
//! trait captures exactly that surface; the transport behind it is an
//! implementation detail.
//!
//! Two implementations ship here:
//! - [`VirshHypervisor`] drives the `virsh` CLI against a configurable
//!   connection URI.
//! - [`FakeHypervisor`] is an in-memory double with failure injection,
//!   used by the provisioner/reconciler/daemon tests.

pub mod error;
pub mod fake;
pub mod virsh;

pub use error::HypervisorError;
pub use fake::FakeHypervisor;
pub use virsh::VirshHypervisor;

use async_trait::async_trait;

/// Result alias for hypervisor operations.
pub type HvResult<T> = Result<T, HypervisorError>;

/// Operations the daemon requires from the hypervisor.
///
/// All operations address objects by name; "not found" outcomes are
/// reported as [`HypervisorError::NotFound`] so callers can make destroy
/// paths idempotent.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Verify the hypervisor is reachable.
    async fn ping(&self) -> HvResult<()>;

    /// Define and activate a virtual network from its XML descriptor.
    async fn define_network(&self, xml: &str) -> HvResult<()>;

    /// Whether an active network with this name exists.
    async fn network_exists(&self, name: &str) -> HvResult<bool>;

    /// Tear down the named network.
    async fn destroy_network(&self, name: &str) -> HvResult<()>;

    /// Create a volume in the given pool.
    async fn create_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> HvResult<()>;

    /// Delete a volume from the given pool.
    async fn delete_volume(&self, pool: &str, name: &str) -> HvResult<()>;

    /// Define a domain from its XML descriptor without starting it.
    async fn define_domain(&self, xml: &str) -> HvResult<()>;

    /// Start a previously defined domain.
    async fn start_domain(&self, name: &str) -> HvResult<()>;

    /// Forcibly stop a running domain.
    async fn destroy_domain(&self, name: &str) -> HvResult<()>;

    /// Remove a domain definition.
    async fn undefine_domain(&self, name: &str) -> HvResult<()>;

    /// Names of all domains (running or not) starting with `name_prefix`.
    async fn list_domains(&self, name_prefix: &str) -> HvResult<Vec<String>>;
}
