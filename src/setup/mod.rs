//! Network construction
//!
//! [`run`] drives the worker through the phases of a build: tear down what a
//! previous run left, prepare the edges, create the root namespace and adopt
//! the edge interfaces, create hosts and links from the topology, plan
//! routes, attach clients to edges and finally install the internal routes.
//! A failure in any phase tears the partial network down again.

pub mod edges;
pub mod routing;
pub mod topology;

use crate::config::{EdgeSpec, Settings};
use crate::queue::WorkQueue;
use crate::worker::{ClientFlows, ClientRoutes, Command, EdgeIface};
use crate::{Error, Result};
use anyhow::Context;
use ipnetwork::Ipv4Network;
use netaddr::MacAddr;
use route_planner::RoutePlanner;
use std::io::Write;
use topology::{Builder, Topology};
use tracing::{debug, error, info, warn};

/// Destination for commands that need no reply
pub trait CommandSink {
    fn submit(&mut self, command: Command) -> Result<()>;
}

impl CommandSink for WorkQueue {
    fn submit(&mut self, command: Command) -> Result<()> {
        WorkQueue::submit(self, command)
    }
}

/// Collects commands instead of running them
impl CommandSink for Vec<Command> {
    fn submit(&mut self, command: Command) -> Result<()> {
        self.push(command);
        Ok(())
    }
}

/// An edge after discovery and adoption
#[derive(Debug, Clone)]
pub struct Edge {
    pub spec: EdgeSpec,
    pub iface: EdgeIface,
    pub remote_mac: MacAddr,
    pub vsubnet: Ipv4Network,
    pub port: u32,
}

/// Build the emulation described by `settings`, or only tear down an old one
pub async fn run(settings: &Settings) -> anyhow::Result<()> {
    let queue = WorkQueue::start(settings.worker_config())
        .await
        .context("Failed to start the network worker")?;
    run_on(queue, settings).await
}

/// [`run`] on an already started queue
pub async fn run_on(mut queue: WorkQueue, settings: &Settings) -> anyhow::Result<()> {
    queue
        .query(Command::Destroy)
        .await
        .context("Failed to remove the previous emulation")?;
    if settings.destroy_only {
        queue.shutdown().await?;
        info!("Emulation destroyed");
        return Ok(());
    }

    let result = build(&mut queue, settings).await;
    if let Err(e) = &result {
        error!("Setup failed: {:#}", e);
        info!("Removing the partial emulation");
        let _ = queue.join(true).await;
        if let Err(e) = queue.query(Command::Destroy).await {
            warn!("Cleanup failed: {}", e);
        }
    }
    queue.shutdown().await?;
    result
}

async fn build(queue: &mut WorkQueue, settings: &Settings) -> anyhow::Result<()> {
    let mut edges = prepare_edges(queue, settings).await?;

    let mtu = edges.iter().map(|e| e.iface.mtu).max();
    queue
        .query(Command::AddRoot { mtu })
        .await
        .context("Failed to create the root namespace")?;
    for edge in edges.iter_mut() {
        edge.port = queue
            .query(Command::AdoptEdge {
                iface: edge.iface.name.clone(),
            })
            .await
            .and_then(|reply| reply.into_port())
            .with_context(|| format!("Failed to adopt edge interface {}", edge.iface.name))?;
    }

    let topology = read_topology(queue, settings, &edges)?;
    queue.join(false).await.context("Failed to create hosts and links")?;

    let mut planner = plan(&topology)?;
    let clients = attach_clients(queue, settings, &edges, &topology).await?;

    let ips: Vec<_> = topology.hosts.iter().map(|h| h.ip).collect();
    tokio::task::block_in_place(|| routing::install_routes(&mut *queue, &mut planner, &clients, &ips))?;
    queue.join(false).await.context("Failed to install routes")?;

    info!(
        "Emulation ready: {} nodes, {} clients on {} edges",
        topology.hosts.len(),
        clients.len(),
        edges.len()
    );
    Ok(())
}

/// Inspect each edge interface, resolve missing MACs and assign vsubnets
async fn prepare_edges(queue: &mut WorkQueue, settings: &Settings) -> anyhow::Result<Vec<Edge>> {
    let specs = &settings.edges;
    let vsubnets = edges::assign_vsubnets(specs, settings.vsubnet)?;
    let mut edges = Vec::with_capacity(specs.len());

    for (spec, vsubnet) in specs.iter().zip(vsubnets) {
        let name = spec
            .iface
            .clone()
            .ok_or(crate::ConfigError::MissingInterface(spec.ip))?;
        let iface = queue
            .query(Command::InspectEdge { iface: name.clone() })
            .await
            .and_then(|reply| reply.into_edge())
            .with_context(|| format!("Failed to inspect interface {}", name))?;
        let remote_mac = match spec.mac {
            Some(mac) => mac,
            None => queue
                .query(Command::DiscoverMac {
                    iface: name.clone(),
                    ip: spec.ip,
                })
                .await
                .and_then(|reply| reply.into_mac())?,
        };
        info!("Edge {} via {} ({}), clients in {}", spec.ip, name, remote_mac, vsubnet);
        edges.push(Edge {
            spec: spec.clone(),
            iface,
            remote_mac,
            vsubnet,
            port: 0,
        });
    }
    Ok(edges)
}

fn read_topology(queue: &mut WorkQueue, settings: &Settings, edges: &[Edge]) -> anyhow::Result<Topology> {
    let path = settings.topology.as_deref().ok_or(crate::ConfigError::MissingTopology)?;
    let vsubnets: Vec<_> = edges.iter().map(|e| e.vsubnet).collect();
    let options = settings.reader_options();

    tokio::task::block_in_place(|| {
        let mut builder = Builder::new(&mut *queue, &vsubnets, edges.len(), settings.two_pass)?;
        graphml::read_file(path, &options, settings.two_pass, &mut builder)?;
        builder.finish()
    })
    .with_context(|| format!("Failed to build topology from {}", path.display()))
}

fn plan(topology: &Topology) -> Result<RoutePlanner> {
    let mut planner = RoutePlanner::new(topology.hosts.len())?;
    for &(a, b, weight) in &topology.weights {
        planner.set_weight(a, b, weight)?;
        planner.set_weight(b, a, weight)?;
    }
    tokio::task::block_in_place(|| planner.plan());
    Ok(planner)
}

/// Spread clients over the edges, give each a slice of its edge's vsubnet and
/// wire it to the edge port. Returns each client's id and subnet.
async fn attach_clients(
    queue: &mut WorkQueue,
    settings: &Settings,
    edges: &[Edge],
    topology: &Topology,
) -> anyhow::Result<Vec<(u32, Ipv4Network)>> {
    let client_ids: Vec<(u32, [MacAddr; 4])> = topology
        .clients()
        .filter_map(|(id, host)| host.client.as_ref().map(|c| (id, c.macs)))
        .collect();
    let counts = edges::client_counts(client_ids.len(), edges.len());

    let mut assigned = Vec::with_capacity(client_ids.len());
    let mut commands = Vec::with_capacity(edges.len());
    let mut remaining = client_ids.iter();

    for (i, (edge, &count)) in edges.iter().zip(&counts).enumerate() {
        let subnets = netaddr::fragment(&edge.vsubnet, count as u32)
            .ok_or_else(|| Error::Exhausted(format!("addresses in {} for {} clients", edge.vsubnet, count)))?;
        for subnet in subnets {
            let Some(&(id, macs)) = remaining.next() else {
                break;
            };
            debug!("Client {} gets {} on edge {}", id, subnet, edge.spec.ip);
            queue.submit(Command::AddClientRoutes(ClientRoutes {
                id,
                subnet,
                root_ip_self: topology.root_ip_self,
                root_ip_other: topology.root_ip_other,
                macs,
            }))?;
            // Port numbers depend on creation order, so switch changes run one at a time
            queue
                .query(Command::AddClientFlows(ClientFlows {
                    id,
                    subnet,
                    edge_port: edge.port,
                    edge_vsubnet: edge.vsubnet,
                    edge_local_mac: edge.iface.mac,
                    edge_remote_mac: edge.remote_mac,
                    macs,
                }))
                .await
                .with_context(|| format!("Failed to attach client {}", id))?;
            assigned.push((id, subnet));
        }

        let others: Vec<_> = edges
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, e)| e.vsubnet)
            .collect();
        commands.push(edges::edge_command(
            &others,
            count,
            edge.iface.addrs.first().copied(),
            edge.vsubnet,
        ));
    }

    write_edge_commands(settings, &commands)?;
    Ok(assigned)
}

fn write_edge_commands(settings: &Settings, commands: &[String]) -> anyhow::Result<()> {
    let mut text = commands.join("\n");
    text.push('\n');
    match &settings.edge_commands {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Edge commands written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use crate::worker::{Execute, Reply};
    use clap::Parser;
    use parking_lot::Mutex;
    use std::ffi::OsString;
    use std::io::Write as _;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const LOCAL_MAC: MacAddr = MacAddr::new([0x52, 0x54, 0, 0, 0, 1]);
    const REMOTE_MAC: MacAddr = MacAddr::new([0x52, 0x54, 0, 0, 0, 2]);

    /// Two clients joined through a relay, with a self link on `a`
    const TOPOLOGY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<graphml xmlns="http://graphml.graphdrawing.org/xmlns">
  <key id="t" for="node" attr.name="type" attr.type="string"/>
  <key id="l" for="edge" attr.name="latency" attr.type="double"/>
  <graph edgedefault="undirected">
    <node id="a"><data key="t">client</data></node>
    <node id="b"><data key="t">client</data></node>
    <node id="c"><data key="t">relay</data></node>
    <edge source="a" target="c"><data key="l">5</data></edge>
    <edge source="b" target="c"><data key="l">7</data></edge>
    <edge source="a" target="a"><data key="l">1</data></edge>
  </graph>
</graphml>
"#;

    /// Plays the worker: records every command and answers with fixed edge
    /// details
    struct Recorder {
        log: Arc<Mutex<Vec<Command>>>,
        fail_on: Option<&'static str>,
        ports: u32,
    }

    impl Execute for Recorder {
        fn execute(&mut self, command: Command) -> Result<Reply> {
            let name = command.name();
            let reply = match &command {
                Command::InspectEdge { iface } => Reply::Edge(EdgeIface {
                    name: iface.clone(),
                    mtu: 1500,
                    mac: LOCAL_MAC,
                    addrs: vec![Ipv4Addr::new(192, 168, 0, 1)],
                }),
                Command::DiscoverMac { .. } => Reply::Mac(REMOTE_MAC),
                Command::AdoptEdge { .. } => {
                    self.ports += 1;
                    Reply::Port(self.ports)
                }
                _ => Reply::Done,
            };
            self.log.lock().push(command);
            if self.fail_on == Some(name) {
                return Err(Error::Internal(format!("{} refused", name)));
            }
            Ok(reply)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: Settings,
        edge_commands: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let topology = dir.path().join("topology.graphml");
        std::fs::File::create(&topology)
            .unwrap()
            .write_all(TOPOLOGY.as_bytes())
            .unwrap();
        let edge_commands = dir.path().join("edges.txt");
        let args: Vec<OsString> = vec![
            "netmirage-core".into(),
            "-f".into(),
            topology.into_os_string(),
            "-e".into(),
            "192.168.0.2,iface=eth1".into(),
            "--edge-commands".into(),
            edge_commands.clone().into_os_string(),
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        Fixture {
            settings: Settings::resolve(cli).unwrap(),
            edge_commands,
            _dir: dir,
        }
    }

    async fn recorder(fail_on: Option<&'static str>) -> (WorkQueue, Arc<Mutex<Vec<Command>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        let queue = WorkQueue::spawn_with(move || {
            Ok(Recorder {
                log: shared,
                fail_on,
                ports: 0,
            })
        })
        .await
        .unwrap();
        (queue, log)
    }

    fn names(log: &[Command]) -> Vec<&'static str> {
        log.iter().map(Command::name).collect()
    }

    fn count(log: &[Command], name: &str) -> usize {
        log.iter().filter(|c| c.name() == name).count()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_build_runs_phases_in_order() {
        let fixture = fixture();
        let (queue, log) = recorder(None).await;
        run_on(queue, &fixture.settings).await.unwrap();
        let log = log.lock().clone();

        // Three nodes, one edge, two clients and a path a-c-b routed both ways
        assert_eq!(
            names(&log),
            vec![
                "destroy",
                "inspect edge",
                "discover MAC",
                "add root",
                "adopt edge",
                "add host",
                "add host",
                "add host",
                "tune ARP",
                "add link",
                "add link",
                "set self link",
                "add client routes",
                "add client flows",
                "add client routes",
                "add client flows",
                "add internal route",
                "add internal route",
                "add internal route",
                "add internal route",
            ]
        );
        assert_eq!(log[3], Command::AddRoot { mtu: Some(1500) });
        assert_eq!(
            log.iter()
                .filter_map(|c| match c {
                    Command::AddHost(host) => Some(host.client.is_some()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            vec![true, true, false]
        );

        let flows: Vec<&ClientFlows> = log
            .iter()
            .filter_map(|c| match c {
                Command::AddClientFlows(flows) => Some(flows),
                _ => None,
            })
            .collect();
        for flows in &flows {
            assert_eq!(flows.edge_port, 1);
            assert_eq!(flows.edge_remote_mac, REMOTE_MAC);
            assert_eq!(flows.edge_local_mac, LOCAL_MAC);
            assert!(flows.edge_vsubnet.contains(flows.subnet.network()));
        }
        assert_ne!(flows[0].subnet, flows[1].subnet);

        let written = std::fs::read_to_string(&fixture.edge_commands).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.starts_with(edges::EDGE_TOOL), "{}", written);
        assert!(written.contains("-c 2"), "{}", written);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_destroys_partial_network() {
        let fixture = fixture();
        let (queue, log) = recorder(Some("add link")).await;
        let err = run_on(queue, &fixture.settings).await.unwrap_err();
        assert!(format!("{:#}", err).contains("add link refused"), "{:#}", err);

        let log = log.lock().clone();
        assert_eq!(count(&log, "add link"), 1);
        assert_eq!(count(&log, "set self link"), 0);
        assert_eq!(count(&log, "add internal route"), 0);
        assert_eq!(count(&log, "destroy"), 2);
        assert_eq!(log.last(), Some(&Command::Destroy));
        assert!(!fixture.edge_commands.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_destroy_only_stops_after_teardown() {
        let mut fixture = fixture();
        fixture.settings.destroy_only = true;
        let (queue, log) = recorder(None).await;
        run_on(queue, &fixture.settings).await.unwrap();
        assert_eq!(*log.lock(), vec![Command::Destroy]);
    }
}
