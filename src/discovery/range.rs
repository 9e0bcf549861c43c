//! IPv4 scan range arithmetic.

use std::net::Ipv4Addr;

/// The usable hosts of the subnet containing an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    network: u32,
    broadcast: u32,
}

impl ScanRange {
    pub fn new(address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let address = u32::from(address);
        let mask = u32::from(mask);

        Self {
            network: address & mask,
            broadcast: address | !mask,
        }
    }

    /// True if the mask is a run of ones followed by a run of zeros.
    pub fn is_valid_mask(mask: Ipv4Addr) -> bool {
        let mask = u32::from(mask);
        mask.leading_ones() + mask.trailing_zeros() == 32
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.broadcast)
    }

    /// Number of addresses strictly between network and broadcast.
    pub fn len(&self) -> usize {
        (self.broadcast - self.network).saturating_sub(1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hosts in ascending order, network and broadcast excluded.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.network.saturating_add(1)..self.broadcast).map(Ipv4Addr::from)
    }
}
