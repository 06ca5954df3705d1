//! Subnet arithmetic and fragmentation

use crate::AddrError;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Ranges that must never be handed out as interface addresses.
pub const RESERVED_SUBNETS: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

/// Parse a dot-decimal IPv4 address
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, AddrError> {
    Ipv4Addr::from_str(s.trim()).map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

/// Parse a CIDR subnet. A bare address is treated as a /32. Host bits are
/// cleared so that the result always starts on a subnet boundary.
pub fn parse_cidr(s: &str) -> Result<Ipv4Network, AddrError> {
    let net =
        Ipv4Network::from_str(s.trim()).map_err(|_| AddrError::InvalidCidr(s.to_string()))?;
    Ipv4Network::new(net.network(), net.prefix()).map_err(|_| AddrError::InvalidCidr(s.to_string()))
}

/// Mask covering the host part of the subnet
pub fn host_mask(net: &Ipv4Network) -> u32 {
    ((1u64 << (32 - u32::from(net.prefix()))) - 1) as u32
}

/// First address of the subnet
pub fn subnet_start(net: &Ipv4Network) -> u32 {
    u32::from(net.ip()) & !host_mask(net)
}

/// Last address of the subnet
pub fn subnet_end(net: &Ipv4Network) -> u32 {
    subnet_start(net) | host_mask(net)
}

/// Number of addresses in the subnet. With `exclude_reserved`, the network
/// and broadcast addresses are not counted (for prefixes shorter than /31).
pub fn subnet_size(net: &Ipv4Network, exclude_reserved: bool) -> u64 {
    let size = 1u64 << (32 - u32::from(net.prefix()));
    if exclude_reserved && net.prefix() < 31 {
        size - 2
    } else {
        size
    }
}

// `start` is aligned on `size`, a power of two no larger than 2^32
fn network_at(start: u64, size: u64) -> Option<Ipv4Network> {
    let prefix = 32 - size.trailing_zeros() as u8;
    Ipv4Network::new(Ipv4Addr::from(start as u32), prefix).ok()
}

/// Split `net` into `count` contiguous, disjoint fragments covering it entirely.
///
/// A power-of-two count yields equal pieces. Otherwise the small fragment size
/// `s` is the largest power of two not exceeding `size / count`; enough
/// fragments of size `2s` are emitted first to absorb the remainder and the
/// rest have size `s`. Returns `None` when the subnet has fewer addresses than
/// requested fragments.
pub fn fragment(net: &Ipv4Network, count: u32) -> Option<Vec<Ipv4Network>> {
    if count == 0 {
        return Some(Vec::new());
    }
    let size = subnet_size(net, false);
    let count64 = u64::from(count);
    if size < count64 {
        return None;
    }

    let start = u64::from(subnet_start(net));
    let mut fragments = Vec::with_capacity(count as usize);

    if count.is_power_of_two() {
        let piece = size / count64;
        for i in 0..count64 {
            fragments.push(network_at(start + i * piece, piece)?);
        }
        return Some(fragments);
    }

    let small = prev_power_of_two(size / count64);
    let large_count = (size - small * count64) / small;
    let mut cursor = start;
    for _ in 0..large_count {
        fragments.push(network_at(cursor, small * 2)?);
        cursor += small * 2;
    }
    for _ in large_count..count64 {
        fragments.push(network_at(cursor, small)?);
        cursor += small;
    }
    Some(fragments)
}

fn prev_power_of_two(value: u64) -> u64 {
    1u64 << (63 - value.leading_zeros())
}
