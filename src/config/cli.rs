use super::EdgeSpec;
use crate::logging::Verbosity;
use clap::Parser;
use graphml::BandwidthUnits;
use ipnetwork::Ipv4Network;
use std::path::PathBuf;

/// Command line options. Everything that can also come from a setup file is
/// optional here so that the file only fills what the command line left out.
#[derive(Parser, Debug, Default, Clone)]
#[command(
    name = "netmirage-core",
    version,
    about = "Emulate a large IP network on this host and connect it to edge machines"
)]
pub struct Cli {
    /// GraphML topology file
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Setup file with an [emulator] group of options and one group per edge
    #[arg(short, long, value_name = "FILE")]
    pub setup_file: Option<PathBuf>,

    /// Tear down a previous emulation and exit
    #[arg(short, long)]
    pub destroy: bool,

    /// Interface for edge nodes that do not name one
    #[arg(short, long, value_name = "IFACE")]
    pub iface: Option<String>,

    /// Client subnet shared among edges without their own vsubnet [default: 10.0.0.0/8]
    #[arg(long, value_name = "CIDR", value_parser = netaddr::parse_cidr)]
    pub vsubnet: Option<Ipv4Network>,

    /// Edge node, repeatable
    #[arg(short, long = "edge-node", value_name = "IP[,iface=IFACE][,mac=MAC][,vsubnet=CIDR]")]
    pub edge_nodes: Vec<EdgeSpec>,

    /// debug, info, warning or error (or 0-3) [default: info]
    #[arg(short, long, value_name = "LEVEL")]
    pub verbosity: Option<Verbosity>,

    /// Append log records to this file instead of standard error
    #[arg(short = 'o', long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Prefix of namespace names [default: nm-]
    #[arg(long, value_name = "PREFIX")]
    pub netns_prefix: Option<String>,

    /// Open vSwitch state directory [default: /tmp/netmirage]
    #[arg(long, value_name = "DIR")]
    pub ovs_dir: Option<PathBuf>,

    /// Open vSwitch database schema
    #[arg(long, value_name = "FILE")]
    pub ovs_schema: Option<PathBuf>,

    /// Memory for open namespace handles, in MiB [default: 2048]
    #[arg(short, long, value_name = "MiB")]
    pub mem: Option<usize>,

    /// Bandwidth units of the topology: shadow, modelnet, KiB or Kb [default: shadow]
    #[arg(short, long, value_name = "UNITS")]
    pub units: Option<BandwidthUnits>,

    /// Link attribute used as routing weight [default: latency]
    #[arg(short, long, value_name = "KEY")]
    pub weight: Option<String>,

    /// Node type marking clients [default: client]
    #[arg(short, long, value_name = "TYPE")]
    pub client_node: Option<String>,

    /// Read the topology twice so that links may precede their nodes
    #[arg(long)]
    pub two_pass: bool,

    /// Write edge setup commands here instead of standard output
    #[arg(long, value_name = "FILE")]
    pub edge_commands: Option<PathBuf>,
}
