use super::command::client_mac::*;
use super::command::*;
use super::{Execute, WorkerConfig};
use crate::context::{ContextCache, NetContext, ROOT_NAMESPACE};
use crate::netlink::{IfAddr, NetemParams, PschedClock, Route, Rule, VethEnd};
use crate::netns::NamespaceDir;
use crate::ovs::{priority, IpFlow, Ovs};
use crate::sysctl::Sysctl;
use crate::{Error, Result};
use caps::{CapSet, Capability};
use ipnetwork::Ipv4Network;
use netaddr::MacAddr;
use nix::errno::Errno;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Command as Process, Stdio};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// The OVS bridge in the root namespace
pub const BRIDGE_NAME: &str = "nm-switch";

/// ARP cache lookups before MAC discovery gives up
pub const PING_ATTEMPTS: u32 = 3;

const PING_WAIT: Duration = Duration::from_secs(1);

/// Routing table for traffic a client sends back out of its self link
const CLIENT_TABLE: u32 = 120;
const CLIENT_RULE_PRIORITY: u32 = 100;

/// Interface naming
pub mod names {
    use super::BRIDGE_NAME;

    /// Client end of the self link
    pub const SELF: &str = "self";
    /// Client end of the root link
    pub const ROOT: &str = "root";

    /// The interface leading to node `peer`
    pub fn node(peer: u32) -> String {
        format!("node-{}", peer)
    }

    /// Root end of client `id`'s self link
    pub fn self_link(id: u32) -> String {
        format!("self-{}", id)
    }

    /// True for root namespace interfaces created by the emulator itself
    pub fn is_emulator_owned(name: &str) -> bool {
        name == "lo"
            || name == BRIDGE_NAME
            || ["ovs-", "self-", "node-"].iter().any(|p| name.starts_with(p))
    }
}

fn check_capabilities() -> Result<()> {
    for (cap, name) in [
        (Capability::CAP_NET_ADMIN, "CAP_NET_ADMIN"),
        (Capability::CAP_SYS_ADMIN, "CAP_SYS_ADMIN"),
    ] {
        let held = caps::has_cap(None, CapSet::Effective, cap)
            .map_err(|e| Error::Internal(format!("failed to query {}: {}", name, e)))?;
        if !held {
            return Err(Error::Capability(name));
        }
    }
    Ok(())
}

fn shape(ctx: &mut NetContext, clock: &PschedClock, index: u32, params: &NetemParams) -> Result<()> {
    ctx.netlink.set_netem(index, params, clock)?;
    Ok(())
}

/// Address, raise and route one end of a node-to-node link
fn configure_link_end(
    ctx: &mut NetContext,
    clock: &PschedClock,
    name: &str,
    local_ip: Ipv4Addr,
    peer_ip: Ipv4Addr,
    peer_mac: MacAddr,
    params: &NetemParams,
) -> Result<()> {
    let index = ctx.ioctl.index(name)?;
    ctx.netlink.add_address(
        &IfAddr {
            index,
            addr: local_ip,
            prefix: 32,
            broadcast: None,
        },
        None,
    )?;
    ctx.ioctl.set_up(name, true)?;
    ctx.netlink.add_neighbor(index, peer_ip, peer_mac)?;
    ctx.netlink.add_route(&Route::link(Ipv4Network::from(peer_ip), index))?;
    if !params.is_noop() {
        shape(ctx, clock, index, params)?;
    }
    Ok(())
}

fn dup(ctx: &NetContext) -> Result<OwnedFd> {
    Ok(ctx.fd().try_clone_to_owned()?)
}

fn probe(iface: &str, ip: Ipv4Addr) {
    let ip = ip.to_string();
    match Process::new("ping")
        .args(["-c1", "-W1", "-I", iface, &ip])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => trace!("ping {} via {} exited with {}", ip, iface, status),
        Err(e) => warn!("Failed to run ping: {}", e),
    }
}

/// Kernel-side state of the emulation, owned by the worker thread
pub struct Worker {
    cache: ContextCache,
    sysctl: Sysctl,
    ovs: Ovs,
    schema: PathBuf,
    clock: PschedClock,
    mtu: Option<u32>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        check_capabilities()?;
        let clock = PschedClock::read(&config.psched_path)?;
        let dir = NamespaceDir::new(config.netns_dir, config.netns_prefix);
        let mut cache = ContextCache::new(dir, config.mem_budget);
        cache.default_ns()?;
        Ok(Self {
            cache,
            sysctl: Sysctl::default(),
            ovs: Ovs::new(config.ovs_dir),
            schema: config.ovs_schema,
            clock,
            mtu: None,
        })
    }

    fn inspect_edge(&mut self, iface: String) -> Result<Reply> {
        let ctx = self.cache.default_ns()?;
        let index = ctx.ioctl.index(&iface)?;
        let edge = EdgeIface {
            mtu: ctx.ioctl.mtu(&iface)?,
            mac: ctx.ioctl.hwaddr(&iface)?,
            addrs: ctx
                .netlink
                .addresses(Some(index))?
                .into_iter()
                .map(|a| a.addr)
                .collect(),
            name: iface,
        };
        debug!("Edge interface {:?}", edge);
        Ok(Reply::Edge(edge))
    }

    fn discover_mac(&mut self, iface: String, ip: Ipv4Addr) -> Result<Reply> {
        let ctx = self.cache.default_ns()?;
        let index = ctx.ioctl.index(&iface)?;
        for attempt in 1..=PING_ATTEMPTS {
            match ctx.netlink.neighbor_mac(index, ip) {
                Ok(mac) => {
                    debug!("{} on {} is at {}", ip, iface, mac);
                    return Ok(Reply::Mac(mac));
                }
                Err(e) if e.errno() == Some(Errno::EAGAIN) => {
                    if attempt < PING_ATTEMPTS {
                        debug!("{} not in ARP cache of {}; probing", ip, iface);
                        probe(&iface, ip);
                        std::thread::sleep(PING_WAIT);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::MacDiscovery { iface, ip })
    }

    fn add_root(&mut self, mtu: Option<u32>) -> Result<Reply> {
        self.mtu = mtu;
        let ctx = self.cache.root(true, true)?;
        self.sysctl.configure_router()?;
        ctx.ioctl.set_up("lo", true)?;

        self.ovs.start(&self.schema)?;
        self.ovs.add_bridge(BRIDGE_NAME, mtu)?;
        self.cache.root(false, false)?.ioctl.set_up(BRIDGE_NAME, true)?;
        info!("Created root namespace with bridge {}", BRIDGE_NAME);
        Ok(Reply::Done)
    }

    fn adopt_edge(&mut self, iface: String) -> Result<Reply> {
        let root_fd = dup(self.cache.root(false, false)?)?;

        let ctx = self.cache.default_ns()?;
        let index = ctx.ioctl.index(&iface)?;
        let mac = ctx.ioctl.hwaddr(&iface)?;
        let addrs = ctx.netlink.addresses(Some(index))?;
        ctx.netlink.move_link(index, root_fd.as_fd())?;

        let ctx = self.cache.root(false, false)?;
        let index = ctx.ioctl.index(&iface)?;
        for addr in &addrs {
            ctx.netlink.add_address(&IfAddr { index, ..*addr }, None)?;
        }
        if let Err(e) = ctx.ioctl.set_gro(&iface, false) {
            warn!("Could not disable GRO on {}: {}", iface, e);
        }
        ctx.ioctl.set_up(&iface, true)?;

        let port = self.ovs.add_port(BRIDGE_NAME, &iface)?;
        for addr in &addrs {
            self.ovs.add_arp_responder(BRIDGE_NAME, addr.addr, mac)?;
        }
        info!("Adopted edge interface {} as port {}", iface, port);
        Ok(Reply::Port(port))
    }

    fn add_host(&mut self, spec: HostSpec) -> Result<Reply> {
        let ctx = self.cache.node(spec.id, true, true)?;
        self.sysctl.configure_router()?;
        ctx.ioctl.set_up("lo", true)?;

        let Some(client) = spec.client else {
            trace!("Created namespace for node {}", spec.id);
            return Ok(Reply::Done);
        };

        let node_fd = dup(ctx)?;
        let root_fd = dup(self.cache.root(false, false)?)?;
        let self_root = names::self_link(spec.id);
        let node_root = names::node(spec.id);

        let ctx = self.cache.node(spec.id, false, false)?;
        let pairs = [
            (names::SELF, SELF_CLIENT, self_root.as_str(), SELF_ROOT),
            (names::ROOT, NODE_CLIENT, node_root.as_str(), NODE_ROOT),
        ];
        for (client_name, client_mac, root_name, root_mac) in pairs {
            ctx.netlink.create_veth(
                &VethEnd {
                    name: client_name,
                    mac: client.macs[client_mac],
                    netns: node_fd.as_fd(),
                },
                &VethEnd {
                    name: root_name,
                    mac: client.macs[root_mac],
                    netns: root_fd.as_fd(),
                },
                self.mtu,
            )?;
        }
        for name in [names::SELF, names::ROOT] {
            let index = ctx.ioctl.index(name)?;
            ctx.netlink.add_address(
                &IfAddr {
                    index,
                    addr: spec.ip,
                    prefix: 32,
                    broadcast: None,
                },
                None,
            )?;
            ctx.ioctl.set_up(name, true)?;
            if !client.down.is_noop() {
                shape(ctx, &self.clock, index, &client.down)?;
            }
        }

        let ctx = self.cache.root(false, false)?;
        for name in [&self_root, &node_root] {
            let index = ctx.ioctl.index(name)?;
            ctx.ioctl.set_up(name, true)?;
            if !client.up.is_noop() {
                shape(ctx, &self.clock, index, &client.up)?;
            }
        }
        trace!("Created client {} at {}", spec.id, spec.ip);
        Ok(Reply::Done)
    }

    fn set_self_link(&mut self, id: u32, up: NetemParams, down: NetemParams) -> Result<Reply> {
        let ctx = self.cache.root(false, false)?;
        let index = ctx.ioctl.index(&names::self_link(id))?;
        shape(ctx, &self.clock, index, &up)?;

        let ctx = self.cache.node(id, false, false)?;
        let index = ctx.ioctl.index(names::SELF)?;
        shape(ctx, &self.clock, index, &down)?;
        Ok(Reply::Done)
    }

    fn tune_arp(&mut self, expected: u64) -> Result<Reply> {
        self.cache.default_ns()?;
        self.sysctl.ensure_arp_capacity(expected)?;
        Ok(Reply::Done)
    }

    fn add_link(&mut self, spec: LinkSpec) -> Result<Reply> {
        let target_fd = dup(self.cache.node(spec.target, false, false)?)?;
        let source_name = names::node(spec.target);
        let target_name = names::node(spec.source);

        let ctx = self.cache.node(spec.source, false, false)?;
        let source_fd = dup(ctx)?;
        ctx.netlink.create_veth(
            &VethEnd {
                name: &source_name,
                mac: spec.macs[0],
                netns: source_fd.as_fd(),
            },
            &VethEnd {
                name: &target_name,
                mac: spec.macs[1],
                netns: target_fd.as_fd(),
            },
            self.mtu,
        )?;
        configure_link_end(
            ctx,
            &self.clock,
            &source_name,
            spec.source_ip,
            spec.target_ip,
            spec.macs[1],
            &spec.source_shape,
        )?;

        let ctx = self.cache.node(spec.target, false, false)?;
        configure_link_end(
            ctx,
            &self.clock,
            &target_name,
            spec.target_ip,
            spec.source_ip,
            spec.macs[0],
            &spec.target_shape,
        )?;
        trace!("Linked nodes {} and {}", spec.source, spec.target);
        Ok(Reply::Done)
    }

    fn add_client_routes(&mut self, routes: ClientRoutes) -> Result<Reply> {
        let ctx = self.cache.node(routes.id, false, false)?;
        let root_index = ctx.ioctl.index(names::ROOT)?;
        let self_index = ctx.ioctl.index(names::SELF)?;

        // Traffic for the client's own subnet leaves towards the edge
        ctx.netlink
            .add_neighbor(root_index, routes.root_ip_other, routes.macs[NODE_ROOT])?;
        ctx.netlink
            .add_route(&Route::via(routes.subnet, routes.root_ip_other, root_index))?;

        // Traffic between clients of the same edge returns through the self link
        let everything = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).map_err(|e| Error::Internal(e.to_string()))?;
        ctx.netlink
            .add_neighbor(self_index, routes.root_ip_self, routes.macs[SELF_ROOT])?;
        ctx.netlink.add_route(
            &Route::via(everything, routes.root_ip_self, self_index).in_table(CLIENT_TABLE),
        )?;
        ctx.netlink.add_rule(&Rule {
            src: routes.subnet,
            iif: Some(names::SELF.to_string()),
            table: CLIENT_TABLE,
            priority: CLIENT_RULE_PRIORITY,
        })?;
        Ok(Reply::Done)
    }

    fn add_client_flows(&mut self, flows: ClientFlows) -> Result<Reply> {
        self.cache.root(false, false)?;
        let self_port = self.ovs.add_port(BRIDGE_NAME, &names::self_link(flows.id))?;
        let node_port = self.ovs.add_port(BRIDGE_NAME, &names::node(flows.id))?;

        let rules = [
            // From the edge to another client of the same edge
            IpFlow {
                priority: priority::SELF,
                in_port: Some(flows.edge_port),
                nw_src: Some(flows.subnet),
                nw_dst: Some(flows.edge_vsubnet),
                dl_src: flows.macs[SELF_ROOT],
                dl_dst: flows.macs[SELF_CLIENT],
                output: self_port,
            },
            // Back out of the self link to the edge
            IpFlow {
                priority: priority::SELF,
                in_port: Some(self_port),
                nw_src: None,
                nw_dst: Some(flows.edge_vsubnet),
                dl_src: flows.edge_local_mac,
                dl_dst: flows.edge_remote_mac,
                output: flows.edge_port,
            },
            // From the edge into the emulated network
            IpFlow {
                priority: priority::IN,
                in_port: Some(flows.edge_port),
                nw_src: Some(flows.subnet),
                nw_dst: None,
                dl_src: flows.macs[NODE_ROOT],
                dl_dst: flows.macs[NODE_CLIENT],
                output: node_port,
            },
            // From the emulated network to the edge
            IpFlow {
                priority: priority::OUT,
                in_port: Some(node_port),
                nw_src: None,
                nw_dst: Some(flows.subnet),
                dl_src: flows.edge_local_mac,
                dl_dst: flows.edge_remote_mac,
                output: flows.edge_port,
            },
        ];
        for rule in &rules {
            self.ovs.add_ip_flow(BRIDGE_NAME, rule)?;
        }
        trace!("Client {} uses ports {} and {}", flows.id, self_port, node_port);
        Ok(Reply::Done)
    }

    fn add_internal_route(&mut self, route: InternalRoute) -> Result<Reply> {
        let ctx = self.cache.node(route.node, false, false)?;
        let index = ctx.ioctl.index(&names::node(route.peer))?;
        match ctx.netlink.add_route(&Route::via(route.dst, route.gateway, index)) {
            Ok(()) => {}
            Err(e) if e.errno() == Some(Errno::EEXIST) => {
                trace!("Route to {} already present in node {}", route.dst, route.node)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Reply::Done)
    }

    /// Move foreign interfaces out of the root namespace with their addresses
    fn restore_edges(&mut self) -> Result<()> {
        let default_fd = dup(self.cache.default_ns()?)?;
        let ctx = self.cache.root(false, false)?;
        let mut moved = Vec::new();
        for link in ctx.netlink.links()? {
            if names::is_emulator_owned(&link.name) {
                continue;
            }
            let addrs = ctx.netlink.addresses(Some(link.index))?;
            ctx.netlink.move_link(link.index, default_fd.as_fd())?;
            moved.push((link.name, addrs));
        }

        let ctx = self.cache.default_ns()?;
        for (name, addrs) in moved {
            let index = ctx.ioctl.index(&name)?;
            for addr in &addrs {
                match ctx.netlink.add_address(&IfAddr { index, ..*addr }, None) {
                    Err(e) if e.errno() != Some(Errno::EEXIST) => return Err(e.into()),
                    _ => {}
                }
            }
            if let Err(e) = ctx.ioctl.set_gro(&name, true) {
                debug!("Could not re-enable GRO on {}: {}", name, e);
            }
            ctx.ioctl.set_up(&name, true)?;
            info!("Returned {} to the default namespace", name);
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<Reply> {
        if self.cache.dir().exists(ROOT_NAMESPACE) {
            if let Err(e) = self.restore_edges() {
                warn!("Failed to restore edge interfaces: {}", e);
            }
        }
        if let Err(e) = self.ovs.stop() {
            warn!("Failed to stop Open vSwitch: {}", e);
        }

        self.cache.default_ns()?;
        self.cache.close_all();
        let names = self.cache.dir().enumerate()?;
        for name in &names {
            self.cache.dir().delete(name)?;
        }
        if names.is_empty() {
            debug!("No namespaces with prefix {}", self.cache.dir().prefix());
        } else {
            info!("Deleted {} namespaces", names.len());
        }
        Ok(Reply::Done)
    }
}

impl Execute for Worker {
    fn execute(&mut self, command: Command) -> Result<Reply> {
        match command {
            Command::Destroy => self.destroy(),
            Command::InspectEdge { iface } => self.inspect_edge(iface),
            Command::DiscoverMac { iface, ip } => self.discover_mac(iface, ip),
            Command::AddRoot { mtu } => self.add_root(mtu),
            Command::AdoptEdge { iface } => self.adopt_edge(iface),
            Command::AddHost(spec) => self.add_host(spec),
            Command::SetSelfLink { id, up, down } => self.set_self_link(id, up, down),
            Command::TuneArp { expected } => self.tune_arp(expected),
            Command::AddLink(spec) => self.add_link(spec),
            Command::AddClientRoutes(routes) => self.add_client_routes(routes),
            Command::AddClientFlows(flows) => self.add_client_flows(flows),
            Command::AddInternalRoute(route) => self.add_internal_route(route),
            Command::Join { .. } => Ok(Reply::Done),
        }
    }

    fn shutdown(&mut self) {
        self.cache.close_all();
        if let Err(e) = self.cache.default_ns() {
            warn!("Could not return to the default namespace: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names() {
        assert_eq!(names::node(17), "node-17");
        assert_eq!(names::self_link(3), "self-3");
        for name in [names::SELF, names::ROOT, "node-4294967295", "self-4294967295"] {
            assert!(name.len() < libc::IF_NAMESIZE);
        }
    }

    #[test]
    fn test_emulator_owned_interfaces() {
        for owned in ["lo", BRIDGE_NAME, "ovs-system", "self-2", "node-9"] {
            assert!(names::is_emulator_owned(owned), "{}", owned);
        }
        for foreign in ["eth0", "enp3s0", "nodes", "selfie"] {
            assert!(!names::is_emulator_owned(foreign), "{}", foreign);
        }
    }
}
