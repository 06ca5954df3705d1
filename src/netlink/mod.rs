//! Route netlink client
//!
//! Messages are built by hand with [`MessageBuilder`] and exchanged over a
//! [`NetlinkSocket`]. Each message family adds its operations to the socket in
//! its own module: links, addresses, neighbors, routes and rules, and qdiscs.

mod addr;
pub mod consts;
mod link;
pub mod message;
mod neigh;
pub mod qdisc;
mod route;
mod socket;

pub use addr::IfAddr;
pub use link::{LinkInfo, VethEnd};
pub use message::{MessageBuilder, MAX_NESTING};
pub use qdisc::{NetemParams, PschedClock};
pub use route::{Route, Rule};
pub use socket::NetlinkSocket;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("Failed to open netlink socket: {0}")]
    Socket(std::io::Error),

    #[error("Netlink I/O failed: {0}")]
    Io(std::io::Error),

    #[error("Kernel rejected {op}: {errno}")]
    Kernel { op: &'static str, errno: Errno },

    #[error("Netlink attributes nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("Malformed netlink message: {0}")]
    Malformed(String),

    #[error("Failed to read packet scheduler clock: {0}")]
    Psched(String),
}

impl NetlinkError {
    /// The kernel errno, if the kernel rejected the request
    pub fn errno(&self) -> Option<Errno> {
        match self {
            NetlinkError::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
