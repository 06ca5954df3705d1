//! MAC addresses and sequential allocation

use crate::AddrError;
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet hardware address
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..]);
        Self(octets)
    }

    /// Parse from a raw byte slice such as a netlink `IFLA_ADDRESS` payload
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(AddrError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(AddrError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| AddrError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

/// Hands out unique, locally administered unicast addresses in sequence.
#[derive(Clone, Debug)]
pub struct MacAllocator {
    next: u64,
}

const LOCAL_PREFIX: u64 = 0x02 << 40;
const LOCAL_SPACE: u64 = 1 << 40;

impl MacAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Number of addresses handed out so far
    pub fn allocated(&self) -> u64 {
        self.next - 1
    }

    pub fn next_mac(&mut self) -> Result<MacAddr, AddrError> {
        if self.next >= LOCAL_SPACE - 1 {
            return Err(AddrError::MacExhausted);
        }
        let mac = MacAddr::from_u64(LOCAL_PREFIX | self.next);
        self.next += 1;
        Ok(mac)
    }

    /// Allocate a fixed number of consecutive addresses
    pub fn take<const N: usize>(&mut self) -> Result<[MacAddr; N], AddrError> {
        let mut macs = [MacAddr::ZERO; N];
        for mac in macs.iter_mut() {
            *mac = self.next_mac()?;
        }
        Ok(macs)
    }
}

impl Default for MacAllocator {
    fn default() -> Self {
        Self::new()
    }
}
