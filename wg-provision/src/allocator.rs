// Ordinal to address mapping

//! Deterministic address allocation
//!
//! A client's addresses are a pure function of its roster ordinal and the
//! configured network blocks. Nothing is stored: the same ordinal always maps
//! to the same addresses, and distinct ordinals always map to distinct
//! addresses because the ordinal is placed verbatim into the host bits.
//!
//! IPv6 host suffixes are `IPV6_HOST_OFFSET | ordinal` inside the low 64 bits
//! of the prefix, so the IPv6 prefix must be a /64 or shorter.

use crate::error::ProvisionError;
use crate::types::{Allocation, NetworkBlock, Roster, SERVER_ORDINAL};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// High-order part of every IPv6 host suffix (`::7767:0:0:<ordinal>`)
pub const IPV6_HOST_OFFSET: u128 = 0x7767 << 48;

/// Longest IPv6 prefix that leaves room for the host suffix
pub const MAX_IPV6_PREFIX_LEN: u8 = 64;

/// Map an ordinal to its addresses inside the given blocks
///
/// Ordinal 1 is the server. Host bits of the blocks are ignored.
///
/// # Errors
///
/// Returns [`ProvisionError::Allocation`] when the ordinal does not fit in the
/// IPv4 block or the IPv6 prefix is longer than /64.
pub fn allocate(
    ordinal: u32,
    ipv4: &Ipv4Net,
    ipv6: Option<&Ipv6Net>,
) -> Result<Allocation, ProvisionError> {
    let capacity = ipv4_capacity(ipv4);
    if ordinal < SERVER_ORDINAL || ordinal > capacity {
        return Err(ProvisionError::Allocation {
            ordinal,
            block: ipv4.trunc().to_string(),
            capacity,
        });
    }

    let network = u32::from(ipv4.network());
    let ipv4_addr = Ipv4Addr::from(network + ordinal);
    let ipv4_if = Ipv4Net::new(ipv4_addr, ipv4.prefix_len()).map_err(|_| {
        ProvisionError::Allocation {
            ordinal,
            block: ipv4.trunc().to_string(),
            capacity,
        }
    })?;

    let ipv6_if = match ipv6 {
        Some(prefix) => Some(ipv6_host(ordinal, prefix)?),
        None => None,
    };

    Ok(Allocation {
        ordinal,
        ipv4: ipv4_if,
        ipv6: ipv6_if,
    })
}

/// Highest ordinal an IPv4 block can hold (network and broadcast excluded)
pub fn ipv4_capacity(block: &Ipv4Net) -> u32 {
    let host_bits = u32::from(block.max_prefix_len() - block.prefix_len());
    if host_bits < 2 {
        return 0;
    }
    let usable = (1u64 << host_bits) - 2;
    u32::try_from(usable).unwrap_or(u32::MAX)
}

fn ipv6_host(ordinal: u32, prefix: &Ipv6Net) -> Result<Ipv6Net, ProvisionError> {
    if prefix.prefix_len() > MAX_IPV6_PREFIX_LEN {
        return Err(ProvisionError::Allocation {
            ordinal,
            block: prefix.trunc().to_string(),
            capacity: 0,
        });
    }
    let network = u128::from(prefix.network());
    let addr = Ipv6Addr::from(network | IPV6_HOST_OFFSET | u128::from(ordinal));
    Ipv6Net::new(addr, prefix.prefix_len()).map_err(|_| ProvisionError::Allocation {
        ordinal,
        block: prefix.trunc().to_string(),
        capacity: 0,
    })
}

/// Allocator bound to one network block
#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
    block: NetworkBlock,
}

impl AddressAllocator {
    /// Create an allocator for the given blocks
    pub fn new(block: NetworkBlock) -> Self {
        Self {
            block: NetworkBlock {
                ipv4: block.ipv4.trunc(),
                ipv6: block.ipv6.map(|net| net.trunc()),
            },
        }
    }

    /// Blocks this allocator hands out addresses from
    pub fn block(&self) -> &NetworkBlock {
        &self.block
    }

    /// Highest usable ordinal
    pub fn capacity(&self) -> u32 {
        ipv4_capacity(&self.block.ipv4)
    }

    /// Addresses for `ordinal`
    pub fn allocate(&self, ordinal: u32) -> Result<Allocation, ProvisionError> {
        allocate(ordinal, &self.block.ipv4, self.block.ipv6.as_ref())
    }

    /// The server's own addresses (ordinal 1)
    pub fn server_allocation(&self) -> Result<Allocation, ProvisionError> {
        self.allocate(SERVER_ORDINAL)
    }

    /// Check that every roster slot, empty ones included, fits the blocks
    ///
    /// Runs before any key material is generated so that an oversized roster
    /// fails the run without side effects.
    pub fn check_roster(&self, roster: &Roster) -> Result<(), ProvisionError> {
        self.server_allocation()?;
        if let Some(highest) = roster.highest_ordinal() {
            self.allocate(highest)?;
        }
        Ok(())
    }

    /// Addresses for every non-empty roster entry, in roster order
    pub fn plan<'r>(
        &self,
        roster: &'r Roster,
    ) -> Result<Vec<(&'r str, Allocation)>, ProvisionError> {
        self.check_roster(roster)?;
        roster
            .entries()
            .map(|(ordinal, name)| Ok((name, self.allocate(ordinal)?)))
            .collect()
    }
}
