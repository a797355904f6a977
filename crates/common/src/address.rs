//! Overlay address allocation
//!
//! Addresses are consumed monotonically: the next lease is always the
//! highest assigned address in the network plus one. Nothing is ever freed.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default overlay network
pub const DEFAULT_NETWORK: &str = "69.69.0.0/16";

/// First address handed out when a network has no leases yet.
/// `.1` is reserved for the lighthouse.
pub const DEFAULT_SEED: Ipv4Addr = Ipv4Addr::new(69, 69, 0, 2);

/// What to do when incrementing past `255.255.255.255`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Error,
    Wrap,
}

/// Add one to an address treated as a big-endian 32-bit integer.
pub fn increment(addr: Ipv4Addr, policy: OverflowPolicy) -> Result<Ipv4Addr> {
    match u32::from(addr).checked_add(1) {
        Some(next) => Ok(Ipv4Addr::from(next)),
        None => match policy {
            OverflowPolicy::Error => Err(Error::AddressExhausted {
                network: "0.0.0.0/0".to_string(),
            }),
            OverflowPolicy::Wrap => Ok(Ipv4Addr::UNSPECIFIED),
        },
    }
}

/// Computes lease candidates inside one overlay network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAllocator {
    network: Ipv4Network,
    seed: Ipv4Addr,
}

impl AddressAllocator {
    pub fn new(network: Ipv4Network, seed: Ipv4Addr) -> Result<Self> {
        let allocator = Self { network, seed };
        if !allocator.is_host(seed) {
            return Err(Error::InvalidInput(format!(
                "seed address {} is not a host address in {}",
                seed, network
            )));
        }
        Ok(allocator)
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    pub fn seed(&self) -> Ipv4Addr {
        self.seed
    }

    /// Stable key for the address space, used to scope leases.
    pub fn network_key(&self) -> String {
        self.network.to_string()
    }

    /// Next address after the highest one currently assigned in the network.
    pub fn next_after(&self, highest: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let last = match highest {
            Some(addr) if addr >= self.seed && self.network.contains(addr) => addr,
            _ => return Ok(self.seed),
        };

        match increment(last, OverflowPolicy::Error) {
            Ok(next) if self.is_host(next) => Ok(next),
            _ => Err(Error::AddressExhausted {
                network: self.network_key(),
            }),
        }
    }

    /// The address with the network's prefix length attached.
    pub fn with_prefix(&self, addr: Ipv4Addr) -> Result<Ipv4Network> {
        Ipv4Network::new(addr, self.network.prefix())
            .map_err(|e| Error::InvalidInput(e.to_string()))
    }

    fn is_host(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(addr)
            && addr != self.network.network()
            && addr != self.network.broadcast()
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self {
            network: Ipv4Network::new(Ipv4Addr::new(69, 69, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Network::from(DEFAULT_SEED)),
            seed: DEFAULT_SEED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_increment_carries_across_octets() {
        let policy = OverflowPolicy::Error;
        assert_eq!(increment(ip("10.0.0.1"), policy).unwrap(), ip("10.0.0.2"));
        assert_eq!(increment(ip("10.0.0.255"), policy).unwrap(), ip("10.0.1.0"));
        assert_eq!(increment(ip("10.0.255.255"), policy).unwrap(), ip("10.1.0.0"));
        assert_eq!(increment(ip("10.255.255.255"), policy).unwrap(), ip("11.0.0.0"));
    }

    #[test]
    fn test_increment_matches_integer_addition() {
        for raw in [0u32, 1, 255, 256, 65_535, 0x0aff_ffff, 0xfffe_ffff, u32::MAX - 1] {
            let next = increment(Ipv4Addr::from(raw), OverflowPolicy::Error).unwrap();
            assert_eq!(u32::from(next), raw + 1);
        }
    }

    #[test]
    fn test_increment_overflow_error_policy() {
        let result = increment(ip("255.255.255.255"), OverflowPolicy::Error);
        assert!(matches!(result, Err(Error::AddressExhausted { .. })));
    }

    #[test]
    fn test_increment_overflow_wrap_policy() {
        let next = increment(ip("255.255.255.255"), OverflowPolicy::Wrap).unwrap();
        assert_eq!(next, ip("0.0.0.0"));
    }

    #[test]
    fn test_allocator_seeds_empty_network() {
        let alloc = AddressAllocator::default();
        assert_eq!(alloc.next_after(None).unwrap(), DEFAULT_SEED);
        assert_eq!(alloc.network_key(), DEFAULT_NETWORK);
    }

    #[test]
    fn test_allocator_follows_highest() {
        let alloc = AddressAllocator::default();
        assert_eq!(alloc.next_after(Some(ip("69.69.0.2"))).unwrap(), ip("69.69.0.3"));
        assert_eq!(alloc.next_after(Some(ip("69.69.0.255"))).unwrap(), ip("69.69.1.0"));
    }

    #[test]
    fn test_allocator_ignores_addresses_below_seed() {
        let alloc = AddressAllocator::default();
        assert_eq!(alloc.next_after(Some(ip("69.69.0.1"))).unwrap(), DEFAULT_SEED);
        assert_eq!(alloc.next_after(Some(ip("10.0.0.9"))).unwrap(), DEFAULT_SEED);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let network = Ipv4Network::new(ip("10.9.0.0"), 30).unwrap();
        let alloc = AddressAllocator::new(network, ip("10.9.0.1")).unwrap();
        assert_eq!(alloc.next_after(Some(ip("10.9.0.1"))).unwrap(), ip("10.9.0.2"));
        // 10.9.0.3 is the broadcast address
        assert!(matches!(
            alloc.next_after(Some(ip("10.9.0.2"))),
            Err(Error::AddressExhausted { .. })
        ));
    }

    #[test]
    fn test_seed_must_be_host() {
        let network = Ipv4Network::new(ip("10.9.0.0"), 24).unwrap();
        assert!(AddressAllocator::new(network, ip("10.9.0.0")).is_err());
        assert!(AddressAllocator::new(network, ip("10.8.0.5")).is_err());
    }

    #[test]
    fn test_with_prefix() {
        let alloc = AddressAllocator::default();
        let cidr = alloc.with_prefix(ip("69.69.3.4")).unwrap();
        assert_eq!(cidr.to_string(), "69.69.3.4/16");
    }
}
