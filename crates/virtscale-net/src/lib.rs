//! virtscale-net — instance addressing and the shared NAT network.
//!
//! Two concerns live here:
//! - [`AddressAllocator`]: maps an instance id to a deterministic IP inside
//!   the fixed /24 subnet, probing linearly on collision. Operators (and
//!   the guest provisioning scripts) can predict an instance's address
//!   from its id alone, without asking the daemon.
//! - [`NetworkProvisioner`]: idempotently creates the one NAT network all
//!   instances attach to, with the gateway pinned to the subnet's first
//!   usable address and no DHCP (guests apply a static artifact). Bridge
//!   names are clamped to the platform's 15-character interface limit.

pub mod addr;
pub mod error;
pub mod network;

pub use addr::AddressAllocator;
pub use error::NetError;
pub use network::{bridge_name, NetworkProvisioner, NetworkRef, IFNAME_MAX};
