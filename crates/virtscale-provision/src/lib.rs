//! virtscale-provision — turning instance ids into running domains.
//!
//! The [`DomainProvisioner`] owns the full provisioning sequence: allocate
//! an address, create the ephemeral disk volume, render the domain
//! descriptor, write the guest artifacts, then define and start the domain.
//! Partial failure unwinds in reverse order so a failed provision never
//! leaves an orphaned volume, definition, or held address behind.
//!
//! Destruction is idempotent: every "already gone" outcome is success, and
//! anything else is surfaced as a retryable [`DestroyError`] with the
//! instance still holding its address until destruction is confirmed.

pub mod domain;
pub mod error;
pub mod provisioner;

pub use domain::DomainSpec;
pub use error::{DestroyError, ProvisionError};
pub use provisioner::DomainProvisioner;
