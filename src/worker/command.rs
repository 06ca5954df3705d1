//! Requests understood by the worker
//!
//! Every command carries its whole payload by value, so the worker never
//! touches front-end memory.

use crate::netlink::NetemParams;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use netaddr::MacAddr;
use std::net::Ipv4Addr;

/// Index of each client MAC in [`ClientHost::macs`]
pub mod client_mac {
    /// `self` inside the client namespace
    pub const SELF_CLIENT: usize = 0;
    /// `self-<id>` in the root namespace
    pub const SELF_ROOT: usize = 1;
    /// `root` inside the client namespace
    pub const NODE_CLIENT: usize = 2;
    /// `node-<id>` in the root namespace
    pub const NODE_ROOT: usize = 3;
}

/// A client's two veth pairs into the root namespace
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHost {
    pub macs: [MacAddr; 4],
    /// Traffic entering the client from the root namespace
    pub up: NetemParams,
    /// Traffic leaving the client towards the root namespace
    pub down: NetemParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    pub id: u32,
    pub ip: Ipv4Addr,
    pub client: Option<ClientHost>,
}

/// A veth pair between two node namespaces
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub source: u32,
    pub target: u32,
    pub source_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    /// MACs of the source and target ends
    pub macs: [MacAddr; 2],
    /// Egress shaping on the source end
    pub source_shape: NetemParams,
    /// Egress shaping on the target end
    pub target_shape: NetemParams,
}

/// Routing inside a client namespace
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRoutes {
    pub id: u32,
    pub subnet: Ipv4Network,
    pub root_ip_self: Ipv4Addr,
    pub root_ip_other: Ipv4Addr,
    pub macs: [MacAddr; 4],
}

/// Switch rules connecting a client to its edge
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFlows {
    pub id: u32,
    pub subnet: Ipv4Network,
    pub edge_port: u32,
    pub edge_vsubnet: Ipv4Network,
    pub edge_local_mac: MacAddr,
    pub edge_remote_mac: MacAddr,
    pub macs: [MacAddr; 4],
}

/// One hop of a path: in `node`, send `dst` through `peer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalRoute {
    pub node: u32,
    pub peer: u32,
    pub dst: Ipv4Network,
    pub gateway: Ipv4Addr,
}

/// An interface as found before adoption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeIface {
    pub name: String,
    pub mtu: u32,
    pub mac: MacAddr,
    pub addrs: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Remove every namespace with our prefix and stop OVS, returning edge
    /// interfaces to the default namespace first
    Destroy,
    /// Describe an interface of the default namespace
    InspectEdge { iface: String },
    /// Resolve the MAC of `ip` behind `iface`, probing if the ARP cache misses
    DiscoverMac { iface: String, ip: Ipv4Addr },
    /// Create the root namespace and its bridge, and start OVS
    AddRoot { mtu: Option<u32> },
    /// Move an edge interface into the root namespace and attach it to the bridge
    AdoptEdge { iface: String },
    AddHost(HostSpec),
    /// Replace the shaping of a client's self link
    SetSelfLink {
        id: u32,
        up: NetemParams,
        down: NetemParams,
    },
    /// Make room for `expected` ARP entries
    TuneArp { expected: u64 },
    AddLink(LinkSpec),
    AddClientRoutes(ClientRoutes),
    AddClientFlows(ClientFlows),
    AddInternalRoute(InternalRoute),
    /// Report, and with `reset` clear, the latched error
    Join { reset: bool },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Destroy => "destroy",
            Command::InspectEdge { .. } => "inspect edge",
            Command::DiscoverMac { .. } => "discover MAC",
            Command::AddRoot { .. } => "add root",
            Command::AdoptEdge { .. } => "adopt edge",
            Command::AddHost(_) => "add host",
            Command::SetSelfLink { .. } => "set self link",
            Command::TuneArp { .. } => "tune ARP",
            Command::AddLink(_) => "add link",
            Command::AddClientRoutes(_) => "add client routes",
            Command::AddClientFlows(_) => "add client flows",
            Command::AddInternalRoute(_) => "add internal route",
            Command::Join { .. } => "join",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Edge(EdgeIface),
    Mac(MacAddr),
    Port(u32),
}

impl Reply {
    fn unexpected(self, wanted: &str) -> Error {
        Error::Internal(format!("expected {} reply, got {:?}", wanted, self))
    }

    pub fn into_edge(self) -> Result<EdgeIface> {
        match self {
            Reply::Edge(edge) => Ok(edge),
            other => Err(other.unexpected("edge")),
        }
    }

    pub fn into_mac(self) -> Result<MacAddr> {
        match self {
            Reply::Mac(mac) => Ok(mac),
            other => Err(other.unexpected("MAC")),
        }
    }

    pub fn into_port(self) -> Result<u32> {
        match self {
            Reply::Port(port) => Ok(port),
            other => Err(other.unexpected("port")),
        }
    }
}
