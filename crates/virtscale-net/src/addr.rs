//! Deterministic instance addressing within a fixed /24 subnet.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::NetError;

/// Lowest host octet handed to instances. `.0` is the network address and
/// `.1` is reserved for the NAT gateway.
const HOST_MIN: u32 = 2;
/// Highest host octet handed to instances; `.255` is the broadcast address.
const HOST_MAX: u32 = 254;
/// Number of allocatable host addresses.
const HOST_SPAN: u32 = HOST_MAX - HOST_MIN + 1;

/// Allocates instance addresses inside one /24 subnet.
///
/// The instance id hashes to a starting slot; on collision with an address
/// already held, the allocator probes linearly (wrapping) until it finds a
/// free slot or the range is exhausted. With an unchanged allocated set the
/// same id therefore always resolves to the same address.
#[derive(Debug)]
pub struct AddressAllocator {
    /// Network address of the subnet (last octet zero).
    subnet: Ipv4Addr,
    allocated: HashSet<Ipv4Addr>,
}

impl AddressAllocator {
    pub fn new(subnet: Ipv4Addr) -> Self {
        let [a, b, c, _] = subnet.octets();
        Self {
            subnet: Ipv4Addr::new(a, b, c, 0),
            allocated: HashSet::new(),
        }
    }

    /// The gateway address: the subnet's first usable host. Never allocated
    /// to an instance.
    pub fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, 1)
    }

    /// Allocate an address for `instance_id` and mark it held.
    pub fn allocate(&mut self, instance_id: &str) -> Result<Ipv4Addr, NetError> {
        let base = hash_slot(instance_id);
        let [a, b, c, _] = self.subnet.octets();
        for offset in 0..HOST_SPAN {
            let host = HOST_MIN + (base + offset) % HOST_SPAN;
            let candidate = Ipv4Addr::new(a, b, c, host as u8);
            if self.allocated.insert(candidate) {
                debug!(id = %instance_id, ip = %candidate, probes = offset, "address allocated");
                return Ok(candidate);
            }
        }
        Err(NetError::AddressSpaceExhausted { subnet: self.subnet })
    }

    /// Return an address to the pool. Only called once the owning
    /// instance's destruction is confirmed.
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        self.allocated.remove(&ip)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

/// Hash an instance id into a host slot in `[0, HOST_SPAN)`.
fn hash_slot(instance_id: &str) -> u32 {
    let digest = Sha256::digest(instance_id.as_bytes());
    let word = u64::from_be_bytes(
        digest[..8]
            .try_into()
            .unwrap_or_else(|_| unreachable!("digest is 32 bytes")),
    );
    (word % u64::from(HOST_SPAN)) as u32
}
