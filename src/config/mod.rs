//! Run settings
//!
//! [`Cli`] holds what the command line said; [`SetupFile`] fills the gaps;
//! [`Settings::resolve`] applies defaults and checks the result before any
//! kernel work starts.

mod cli;
mod edge;
mod file;

pub use cli::Cli;
pub use edge::EdgeSpec;
pub use file::{Entry, SetupFile};

use crate::logging::Verbosity;
use crate::netns::DEFAULT_NETNS_DIR;
use crate::ovs::DEFAULT_SCHEMA;
use crate::worker::WorkerConfig;
use graphml::{BandwidthUnits, ReaderOptions};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_NETNS_PREFIX: &str = "nm-";
pub const DEFAULT_OVS_DIR: &str = "/tmp/netmirage";
pub const DEFAULT_MEM_MIB: usize = 2048;
pub const DEFAULT_VSUBNET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
pub const DEFAULT_VSUBNET_PREFIX: u8 = 8;
pub const PSCHED_PATH: &str = "/proc/net/psched";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read setup file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {message}", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Option '{key}' is ambiguous: {candidates}")]
    AmbiguousOption { key: String, candidates: String },

    #[error("Invalid value '{value}' for {option}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("Invalid edge node '{spec}': {reason}")]
    InvalidEdge { spec: String, reason: String },

    #[error("No topology file given (use --file)")]
    MissingTopology,

    #[error("No edge nodes given (use --edge-node or an [edge] group)")]
    NoEdges,

    #[error("Edge node {0} is listed more than once")]
    DuplicateEdge(Ipv4Addr),

    #[error("No interface for edge node {0} (use iface= or --iface)")]
    MissingInterface(Ipv4Addr),

    #[error("Edge subnets {0} and {1} overlap")]
    OverlappingSubnets(Ipv4Network, Ipv4Network),

    #[error("--mem must be at least 1 MiB")]
    NoMemory,

    #[error("--netns-prefix must not be empty or contain '/'")]
    BadPrefix,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct Settings {
    pub topology: Option<PathBuf>,
    /// Only tear down a previous emulation
    pub destroy_only: bool,
    /// Every edge has an interface once resolved
    pub edges: Vec<EdgeSpec>,
    pub vsubnet: Ipv4Network,
    pub verbosity: Verbosity,
    pub log_file: Option<PathBuf>,
    pub netns_prefix: String,
    pub ovs_dir: PathBuf,
    pub ovs_schema: PathBuf,
    pub mem_mib: usize,
    pub units: BandwidthUnits,
    pub weight_key: String,
    pub client_type: String,
    pub two_pass: bool,
    pub edge_commands: Option<PathBuf>,
}

fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

impl Settings {
    /// Merge the setup file named on the command line, apply defaults and
    /// validate
    pub fn resolve(mut cli: Cli) -> Result<Self, ConfigError> {
        if let Some(path) = cli.setup_file.clone() {
            SetupFile::read(&path)?.apply(&mut cli)?;
        }

        let mem_mib = cli.mem.unwrap_or(DEFAULT_MEM_MIB);
        if mem_mib == 0 {
            return Err(ConfigError::NoMemory);
        }
        let netns_prefix = cli.netns_prefix.unwrap_or_else(|| DEFAULT_NETNS_PREFIX.to_string());
        if netns_prefix.is_empty() || netns_prefix.contains('/') {
            return Err(ConfigError::BadPrefix);
        }

        let mut edges = cli.edge_nodes;
        if !cli.destroy {
            if cli.file.is_none() {
                return Err(ConfigError::MissingTopology);
            }
            if edges.is_empty() {
                return Err(ConfigError::NoEdges);
            }
            for edge in edges.iter_mut() {
                if edge.iface.is_none() {
                    edge.iface = Some(cli.iface.clone().ok_or(ConfigError::MissingInterface(edge.ip))?);
                }
            }
            for (i, a) in edges.iter().enumerate() {
                for b in &edges[i + 1..] {
                    if a.ip == b.ip {
                        return Err(ConfigError::DuplicateEdge(a.ip));
                    }
                    if let (Some(x), Some(y)) = (&a.vsubnet, &b.vsubnet) {
                        if overlaps(x, y) {
                            return Err(ConfigError::OverlappingSubnets(*x, *y));
                        }
                    }
                }
            }
        }

        Ok(Self {
            topology: cli.file,
            destroy_only: cli.destroy,
            edges,
            vsubnet: match cli.vsubnet {
                Some(net) => net,
                None => Ipv4Network::new(DEFAULT_VSUBNET, DEFAULT_VSUBNET_PREFIX).map_err(|e| ConfigError::InvalidValue {
                    option: "vsubnet".into(),
                    value: DEFAULT_VSUBNET.to_string(),
                    reason: e.to_string(),
                })?,
            },
            verbosity: cli.verbosity.unwrap_or_default(),
            log_file: cli.log_file,
            netns_prefix,
            ovs_dir: cli.ovs_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_OVS_DIR)),
            ovs_schema: cli.ovs_schema.unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEMA)),
            mem_mib,
            units: cli.units.unwrap_or_default(),
            weight_key: cli.weight.unwrap_or_else(|| ReaderOptions::default().weight_key),
            client_type: cli.client_node.unwrap_or_else(|| ReaderOptions::default().client_type),
            two_pass: cli.two_pass,
            edge_commands: cli.edge_commands,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
            netns_prefix: self.netns_prefix.clone(),
            ovs_dir: self.ovs_dir.clone(),
            ovs_schema: self.ovs_schema.clone(),
            mem_budget: self.mem_mib.saturating_mul(1024 * 1024),
            psched_path: PathBuf::from(PSCHED_PATH),
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            client_type: self.client_type.clone(),
            weight_key: self.weight_key.clone(),
            units: self.units,
        }
    }
}
