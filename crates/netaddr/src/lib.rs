//! IPv4 subnet and MAC address helpers
//!
//! Small, dependency-light utilities shared by the construction pipeline:
//! CIDR parsing, subnet arithmetic, subnet fragmentation, iteration over a
//! subnet while skipping excluded ranges, and MAC address allocation.

pub mod iter;
pub mod mac;
pub mod subnet;

pub use ipnetwork::Ipv4Network;
pub use iter::Ip4Iter;
pub use mac::{MacAddr, MacAllocator};
pub use subnet::{
    fragment, host_mask, parse_cidr, parse_ipv4, subnet_end, subnet_size, subnet_start,
    RESERVED_SUBNETS,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("Invalid CIDR subnet: {0}")]
    InvalidCidr(String),

    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("MAC address space exhausted")]
    MacExhausted,
}
