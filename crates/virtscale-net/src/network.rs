//! The shared NAT network.
//!
//! One network for the whole fleet, owned by the daemon process and
//! referenced (not owned) by every instance. The gateway sits at the
//! subnet's first usable address; DHCP is deliberately absent — each guest
//! applies the static configuration artifact the provisioner writes for it.

use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use virtscale_hypervisor::Hypervisor;

use crate::error::NetError;

/// Maximum length of a Linux network interface name (`IFNAMSIZ` - 1).
pub const IFNAME_MAX: usize = 15;

/// Derive a bridge interface name from the network name, guaranteed to fit
/// within [`IFNAME_MAX`] no matter how long the input is.
///
/// Short names keep a readable `{name}-br` form; longer ones keep a prefix
/// and gain a hash tag so distinct networks never share a bridge.
pub fn bridge_name(network_name: &str) -> String {
    let sanitized: String = network_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    let candidate = format!("{sanitized}-br");
    if !sanitized.is_empty() && candidate.len() <= IFNAME_MAX {
        return candidate;
    }

    let digest = Sha256::digest(network_name.as_bytes());
    let tag = hex::encode(&digest[..4]);
    let mut keep: String = sanitized.chars().take(IFNAME_MAX - tag.len() - 1).collect();
    if keep.is_empty() {
        keep = "br".to_string();
    }
    format!("{keep}-{tag}")
}

/// Handle to the provisioned NAT network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub name: String,
    pub bridge: String,
    /// Network address of the /24.
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Creates and tears down the shared NAT network.
pub struct NetworkProvisioner {
    name: String,
    subnet: Ipv4Addr,
}

impl NetworkProvisioner {
    pub fn new(name: impl Into<String>, subnet: Ipv4Addr) -> Self {
        let [a, b, c, _] = subnet.octets();
        Self {
            name: name.into(),
            subnet: Ipv4Addr::new(a, b, c, 0),
        }
    }

    fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, 1)
    }

    fn network_ref(&self) -> NetworkRef {
        NetworkRef {
            name: self.name.clone(),
            bridge: bridge_name(&self.name),
            subnet: self.subnet,
            gateway: self.gateway(),
        }
    }

    /// NAT network descriptor. No `<dhcp>` block: addressing is static and
    /// the daemon is the allocator of record.
    fn render_xml(&self) -> String {
        let bridge = bridge_name(&self.name);
        let gateway = self.gateway();
        format!(
            "<network>\n  \
               <name>{name}</name>\n  \
               <forward mode='nat'/>\n  \
               <bridge name='{bridge}' stp='on' delay='0'/>\n  \
               <ip address='{gateway}' netmask='255.255.255.0'/>\n\
             </network>\n",
            name = self.name,
        )
    }

    /// Create the network if it does not already exist. Idempotent: a
    /// pre-existing network with the daemon's name is reused as-is.
    pub async fn ensure<H: Hypervisor + ?Sized>(&self, hv: &H) -> Result<NetworkRef, NetError> {
        if hv.network_exists(&self.name).await? {
            debug!(network = %self.name, "shared network already present");
            return Ok(self.network_ref());
        }

        hv.define_network(&self.render_xml()).await?;
        info!(
            network = %self.name,
            bridge = %bridge_name(&self.name),
            gateway = %self.gateway(),
            "shared NAT network created"
        );
        Ok(self.network_ref())
    }

    /// Tear the network down, tolerating it being already gone.
    pub async fn teardown<H: Hypervisor + ?Sized>(&self, hv: &H) -> Result<(), NetError> {
        match hv.destroy_network(&self.name).await {
            Ok(()) => {
                info!(network = %self.name, "shared NAT network destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(network = %self.name, "shared network already gone");
                Ok(())
            }
            Err(e) => Err(NetError::Setup(e)),
        }
    }
}
