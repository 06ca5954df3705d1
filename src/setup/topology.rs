//! Turns topology records into host and link commands
//!
//! Nodes get identifiers in first-seen order and an address from the whole
//! IPv4 space minus reserved ranges and the edge subnets. Links are either
//! streamed straight to the worker (two-pass reads, where every node is known
//! before the first link) or buffered until the single pass ends.

use super::CommandSink;
use crate::netlink::NetemParams;
use crate::worker::{ClientHost, Command, HostSpec, LinkSpec};
use crate::{Error, Result};
use graphml::{Link, LinkParams, Node, ReadStats, TopologyVisitor};
use ipnetwork::Ipv4Network;
use netaddr::{Ip4Iter, MacAddr, MacAllocator, RESERVED_SUBNETS};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Present for clients
    pub client: Option<ClientHost>,
}

/// Everything later phases need to know about the built topology
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Indexed by node id
    pub hosts: Vec<Host>,
    /// Undirected routing weights
    pub weights: Vec<(u32, u32, f32)>,
    /// Next hop for traffic a client returns through its self link
    pub root_ip_self: Ipv4Addr,
    /// Next hop for traffic a client sends towards its edge
    pub root_ip_other: Ipv4Addr,
}

impl Topology {
    pub fn clients(&self) -> impl Iterator<Item = (u32, &Host)> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.client.is_some())
            .map(|(id, h)| (id as u32, h))
    }
}

fn link_shape(params: &LinkParams) -> NetemParams {
    NetemParams {
        delay_ms: params.latency,
        jitter_ms: params.jitter,
        loss: params.packet_loss,
        rate_mbit: 0.0,
        queue_len: params.queue_len,
    }
}

/// Probability that a packet survives neither of two independent losses
fn combined_loss(a: f64, b: f64) -> f64 {
    1.0 - (1.0 - a) * (1.0 - b)
}

pub struct Builder<'a, S: CommandSink> {
    sink: &'a mut S,
    ips: Ip4Iter,
    macs: MacAllocator,
    ids: HashMap<String, u32>,
    hosts: Vec<Host>,
    linked: HashSet<(u32, u32)>,
    weights: Vec<(u32, u32, f32)>,
    pending: Vec<Link>,
    stream_links: bool,
    arp_tuned: bool,
    edges: usize,
    root_ip_self: Ipv4Addr,
    root_ip_other: Ipv4Addr,
}

impl<'a, S: CommandSink> Builder<'a, S> {
    /// `vsubnets` are kept free of interface addresses. With `stream_links`
    /// every node must be reported before the first link.
    pub fn new(sink: &'a mut S, vsubnets: &[Ipv4Network], edges: usize, stream_links: bool) -> Result<Self> {
        let mut avoid: Vec<Ipv4Network> = RESERVED_SUBNETS
            .iter()
            .map(|&(addr, prefix)| Ipv4Network::new(addr, prefix))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Internal(e.to_string()))?;
        avoid.extend_from_slice(vsubnets);
        let everything = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).map_err(|e| Error::Internal(e.to_string()))?;

        let mut ips = Ip4Iter::new(&everything, &avoid);
        let exhausted = || Error::Exhausted("IPv4 addresses".into());
        let root_ip_self = ips.next().ok_or_else(exhausted)?;
        let root_ip_other = ips.next().ok_or_else(exhausted)?;

        Ok(Self {
            sink,
            ips,
            macs: MacAllocator::new(),
            ids: HashMap::new(),
            hosts: Vec::new(),
            linked: HashSet::new(),
            weights: Vec::new(),
            pending: Vec::new(),
            stream_links,
            arp_tuned: false,
            edges,
            root_ip_self,
            root_ip_other,
        })
    }

    fn client_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.client.is_some()).count()
    }

    /// ARP entries the finished network needs on the host
    fn tune_arp(&mut self, links: usize) -> Result<()> {
        let expected = 2 * links as u64 + 2 * self.client_count() as u64 + self.edges as u64;
        self.sink.submit(Command::TuneArp { expected })?;
        self.arp_tuned = true;
        Ok(())
    }

    fn id_of(&self, name: &str) -> Result<u32> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::Topology(format!("link references unknown node '{}'", name)))
    }

    fn self_link(&mut self, id: u32, link: &Link) -> Result<()> {
        let host = &self.hosts[id as usize];
        let Some(client) = &host.client else {
            warn!("Ignoring reflexive link on non-client node '{}'", host.name);
            return Ok(());
        };
        let mut up = link_shape(&link.up);
        up.rate_mbit = client.up.rate_mbit;
        up.loss = combined_loss(up.loss, client.up.loss);
        let mut down = link_shape(&link.down);
        down.rate_mbit = client.down.rate_mbit;
        down.loss = combined_loss(down.loss, client.down.loss);
        self.sink.submit(Command::SetSelfLink { id, up, down })
    }

    fn add_link(&mut self, link: &Link) -> Result<()> {
        let source = self.id_of(&link.source)?;
        let target = self.id_of(&link.target)?;
        if source == target {
            return self.self_link(source, link);
        }
        if !self.linked.insert((source.min(target), source.max(target))) {
            return Err(Error::Topology(format!(
                "duplicate link between '{}' and '{}'",
                link.source, link.target
            )));
        }

        let macs: [MacAddr; 2] = self.macs.take()?;
        self.sink.submit(Command::AddLink(LinkSpec {
            source,
            target,
            source_ip: self.hosts[source as usize].ip,
            target_ip: self.hosts[target as usize].ip,
            macs,
            source_shape: link_shape(&link.up),
            target_shape: link_shape(&link.down),
        }))?;
        self.weights.push((source, target, link.weight as f32));
        Ok(())
    }

    /// Install buffered links and hand over the result
    pub fn finish(mut self) -> Result<Topology> {
        let pending = std::mem::take(&mut self.pending);
        if !self.arp_tuned {
            self.tune_arp(pending.len())?;
        }
        for link in &pending {
            self.add_link(link)?;
        }
        info!(
            "Topology has {} nodes ({} clients) and {} links",
            self.hosts.len(),
            self.client_count(),
            self.weights.len()
        );
        Ok(Topology {
            hosts: self.hosts,
            weights: self.weights,
            root_ip_self: self.root_ip_self,
            root_ip_other: self.root_ip_other,
        })
    }
}

impl<S: CommandSink> TopologyVisitor for Builder<'_, S> {
    type Error = Error;

    fn on_node(&mut self, node: &Node) -> Result<()> {
        if self.ids.contains_key(&node.name) {
            return Err(Error::Topology(format!("duplicate node '{}'", node.name)));
        }
        let id = u32::try_from(self.hosts.len())
            .ok()
            .filter(|&id| id != u32::MAX)
            .ok_or_else(|| Error::Exhausted("node identifiers".into()))?;
        let ip = self
            .ips
            .next()
            .ok_or_else(|| Error::Exhausted("IPv4 addresses".into()))?;

        let client = if node.client {
            Some(ClientHost {
                macs: self.macs.take()?,
                up: NetemParams {
                    loss: node.packet_loss,
                    rate_mbit: node.bandwidth_up,
                    ..Default::default()
                },
                down: NetemParams {
                    rate_mbit: node.bandwidth_down,
                    ..Default::default()
                },
            })
        } else {
            None
        };

        self.sink.submit(Command::AddHost(HostSpec {
            id,
            ip,
            client: client.clone(),
        }))?;
        self.ids.insert(node.name.clone(), id);
        self.hosts.push(Host {
            name: node.name.clone(),
            ip,
            client,
        });
        Ok(())
    }

    fn on_link(&mut self, link: &Link) -> Result<()> {
        if self.stream_links {
            self.add_link(link)
        } else {
            self.pending.push(link.clone());
            Ok(())
        }
    }

    fn on_nodes_complete(&mut self, stats: &ReadStats) -> Result<()> {
        debug!("All {} nodes known; expecting {} links", stats.nodes, stats.links);
        self.tune_arp(stats.links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphml::LinkParams;

    fn node(name: &str, client: bool) -> Node {
        Node {
            name: name.into(),
            client,
            packet_loss: 0.0,
            bandwidth_up: 10.0,
            bandwidth_down: 20.0,
        }
    }

    fn link(source: &str, target: &str, latency: f64) -> Link {
        let params = LinkParams {
            latency,
            ..Default::default()
        };
        Link {
            source: source.into(),
            target: target.into(),
            weight: latency,
            up: params,
            down: params,
        }
    }

    fn vsubnet() -> Vec<Ipv4Network> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn test_addresses_skip_reserved_and_vsubnets() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &["1.0.0.0/31".parse().unwrap()], 1, false).unwrap();
        builder.on_node(&node("a", true)).unwrap();
        let topology = builder.finish().unwrap();
        assert_eq!(topology.root_ip_self, Ipv4Addr::new(1, 0, 0, 2));
        assert_eq!(topology.root_ip_other, Ipv4Addr::new(1, 0, 0, 3));
        assert_eq!(topology.hosts[0].ip, Ipv4Addr::new(1, 0, 0, 4));
    }

    #[test]
    fn test_buffered_links_follow_arp_tuning() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &vsubnet(), 2, false).unwrap();
        builder.on_node(&node("a", true)).unwrap();
        builder.on_link(&link("a", "b", 5.0)).unwrap();
        builder.on_node(&node("b", false)).unwrap();
        builder.on_node(&node("c", true)).unwrap();
        builder.on_link(&link("b", "c", 7.0)).unwrap();
        let topology = builder.finish().unwrap();

        let names: Vec<_> = sink.iter().map(Command::name).collect();
        assert_eq!(
            names,
            ["add host", "add host", "add host", "tune ARP", "add link", "add link"]
        );
        // 2 links, 2 clients, 2 edges
        assert_eq!(sink[3], Command::TuneArp { expected: 2 * 2 + 2 * 2 + 2 });
        assert_eq!(topology.weights, vec![(0, 1, 5.0), (1, 2, 7.0)]);
        assert_eq!(topology.clients().map(|(id, _)| id).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_client_and_link_macs_are_unique() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &vsubnet(), 1, false).unwrap();
        builder.on_node(&node("a", true)).unwrap();
        builder.on_node(&node("b", true)).unwrap();
        builder.on_link(&link("a", "b", 1.0)).unwrap();
        builder.finish().unwrap();

        let mut macs = Vec::new();
        for command in &sink {
            match command {
                Command::AddHost(HostSpec { client: Some(c), .. }) => macs.extend(c.macs),
                Command::AddLink(l) => macs.extend(l.macs),
                _ => {}
            }
        }
        assert_eq!(macs.len(), 4 + 4 + 2);
        let unique: HashSet<_> = macs.iter().map(MacAddr::to_u64).collect();
        assert_eq!(unique.len(), macs.len());
    }

    #[test]
    fn test_client_shaping_from_node() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &vsubnet(), 1, false).unwrap();
        let mut lossy = node("a", true);
        lossy.packet_loss = 0.1;
        builder.on_node(&lossy).unwrap();
        builder.finish().unwrap();
        let Command::AddHost(HostSpec { client: Some(c), .. }) = &sink[0] else {
            panic!("unexpected {:?}", sink[0]);
        };
        assert_eq!(c.up.rate_mbit, 10.0);
        assert_eq!(c.up.loss, 0.1);
        assert_eq!(c.down.rate_mbit, 20.0);
        assert_eq!(c.down.loss, 0.0);
    }

    #[test]
    fn test_reflexive_links() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &vsubnet(), 1, true).unwrap();
        builder.on_node(&node("a", true)).unwrap();
        builder.on_node(&node("b", false)).unwrap();
        builder.on_nodes_complete(&ReadStats { nodes: 2, links: 2 }).unwrap();
        builder.on_link(&link("a", "a", 3.0)).unwrap();
        builder.on_link(&link("b", "b", 3.0)).unwrap();
        let topology = builder.finish().unwrap();

        assert!(topology.weights.is_empty());
        match sink.last() {
            Some(Command::SetSelfLink { id: 0, up, down }) => {
                assert_eq!(up.delay_ms, 3.0);
                assert_eq!(up.rate_mbit, 10.0);
                assert_eq!(down.rate_mbit, 20.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.iter().filter(|c| c.name() == "set self link").count(), 1);
    }

    #[test]
    fn test_topology_errors() {
        let mut sink = Vec::new();
        let mut builder = Builder::new(&mut sink, &vsubnet(), 1, true).unwrap();
        builder.on_node(&node("a", false)).unwrap();
        builder.on_node(&node("b", false)).unwrap();
        assert!(matches!(builder.on_node(&node("a", false)), Err(Error::Topology(_))));
        assert!(matches!(builder.on_link(&link("a", "zz", 1.0)), Err(Error::Topology(_))));
        builder.on_link(&link("a", "b", 1.0)).unwrap();
        assert!(matches!(builder.on_link(&link("b", "a", 1.0)), Err(Error::Topology(_))));
    }
}
