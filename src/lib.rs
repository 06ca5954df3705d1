//! NetMirage core
//!
//! Builds an emulated IP network on one Linux host from a GraphML topology: one
//! network namespace per topology node, veth pairs with netem shaping between
//! them, static routes along all-pairs shortest paths, and an Open vSwitch
//! bridge in a shared root namespace that connects clients to the physical
//! interfaces leading to edge machines.
//!
//! Kernel work happens on a single worker thread ([`worker`]) fed through an
//! asynchronous [`queue::WorkQueue`]; [`setup`] drives the construction.

pub mod config;
pub mod context;
pub mod ioctl;
pub mod logging;
pub mod netlink;
pub mod netns;
pub mod ovs;
pub mod queue;
pub mod setup;
pub mod sysctl;
pub mod worker;

use std::sync::Arc;
use thiserror::Error;

pub use config::{ConfigError, EdgeSpec, Settings};
pub use queue::WorkQueue;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Netlink(#[from] netlink::NetlinkError),

    #[error(transparent)]
    Ioctl(#[from] ioctl::IoctlError),

    #[error(transparent)]
    NetNs(#[from] netns::NetNsError),

    #[error(transparent)]
    Sysctl(#[from] sysctl::SysctlError),

    #[error(transparent)]
    Ovs(#[from] ovs::OvsError),

    #[error(transparent)]
    Planner(#[from] route_planner::PlannerError),

    #[error(transparent)]
    Addr(#[from] netaddr::AddrError),

    #[error(transparent)]
    Graphml(#[from] graphml::GraphmlError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing capability {0} (run as root)")]
    Capability(&'static str),

    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Could not discover the MAC address of {ip} behind {iface}; give it with mac= in the edge definition")]
    MacDiscovery { iface: String, ip: std::net::Ipv4Addr },

    #[error("Out of {0}")]
    Exhausted(String),

    #[error("Worker thread is gone")]
    WorkerGone,

    #[error("Internal error: {0}")]
    Internal(String),

    /// An earlier failure that stopped the work queue
    #[error("{0}")]
    Latched(Arc<Error>),
}

impl Error {
    /// The kernel errno behind this error, if any
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            Error::Netlink(e) => e.errno(),
            Error::Ioctl(e) => e.errno(),
            Error::Latched(e) => e.errno(),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
