//! GraphML topology reader
//!
//! Streams a GraphML document and reports each `<node>` and `<edge>` to a
//! [`TopologyVisitor`] as typed [`Node`] and [`Link`] records. `<key>`
//! declarations map `<data key="…">` ids to attribute names; bandwidth values
//! are converted to Mbit/s according to [`BandwidthUnits`].
//!
//! Nodes must appear before the edges that reference them unless the file is
//! read in two passes with [`read_file`] and `two_pass` set.

mod reader;
mod units;

pub use reader::{read, read_file, Pass};
pub use units::BandwidthUnits;

#[derive(Debug)]
pub enum GraphmlError {
    Io(std::io::Error),

    Xml {
        position: u64,
        source: quick_xml::Error,
    },

    Malformed(String),

    AnonymousNode,

    MissingEndpoint(&'static str),

    DirectedEdge { source: String, target: String },

    MissingWeight {
        source: String,
        target: String,
        key: String,
    },

    InvalidValue { key: String, value: String },

    UnknownUnits(String),
}

// Display/Error are written by hand because thiserror treats any field named
// `source` as the error cause, which the String endpoint fields are not.
impl std::fmt::Display for GraphmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphmlError::Io(e) => write!(f, "I/O error reading topology: {e}"),
            GraphmlError::Xml { position, source } => {
                write!(f, "Malformed GraphML at byte {position}: {source}")
            }
            GraphmlError::Malformed(m) => write!(f, "Malformed GraphML: {m}"),
            GraphmlError::AnonymousNode => write!(f, "Node without an id attribute"),
            GraphmlError::MissingEndpoint(a) => write!(f, "Edge is missing its {a} attribute"),
            GraphmlError::DirectedEdge { source, target } => {
                write!(f, "Directed edge {source} -> {target} is not supported")
            }
            GraphmlError::MissingWeight { source, target, key } => {
                write!(f, "Edge {source} -> {target} has no '{key}' weight")
            }
            GraphmlError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{value}' for attribute '{key}'")
            }
            GraphmlError::UnknownUnits(u) => write!(f, "Unknown bandwidth units '{u}'"),
        }
    }
}

impl std::error::Error for GraphmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphmlError::Io(e) => Some(e),
            GraphmlError::Xml { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GraphmlError {
    fn from(e: std::io::Error) -> Self {
        GraphmlError::Io(e)
    }
}

/// Reader settings
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Value of the node `type` attribute that marks a client
    pub client_type: String,
    /// Edge attribute used as the routing weight
    pub weight_key: String,
    pub units: BandwidthUnits,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            client_type: "client".to_string(),
            weight_key: "latency".to_string(),
            units: BandwidthUnits::Shadow,
        }
    }
}

/// A topology vertex
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub client: bool,
    /// Loss fraction applied to traffic leaving the node
    pub packet_loss: f64,
    /// Mbit/s, 0 when unlimited
    pub bandwidth_up: f64,
    /// Mbit/s, 0 when unlimited
    pub bandwidth_down: f64,
}

/// Shaping for one direction of a link
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkParams {
    /// Milliseconds
    pub latency: f64,
    /// Milliseconds
    pub jitter: f64,
    pub packet_loss: f64,
    /// Packets, 0 for the kernel default
    pub queue_len: u32,
}

/// An undirected topology edge. `up` shapes traffic from source to target.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub source: String,
    pub target: String,
    pub weight: f64,
    pub up: LinkParams,
    pub down: LinkParams,
}

impl Link {
    pub fn is_reflexive(&self) -> bool {
        self.source == self.target
    }
}

/// Element counts of a document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub nodes: usize,
    pub links: usize,
}

/// Receives records in document order
pub trait TopologyVisitor {
    type Error: From<GraphmlError>;

    fn on_node(&mut self, node: &Node) -> Result<(), Self::Error>;

    fn on_link(&mut self, link: &Link) -> Result<(), Self::Error>;

    /// Called between the passes of a two-pass read, once every node has been
    /// reported
    fn on_nodes_complete(&mut self, _stats: &ReadStats) -> Result<(), Self::Error> {
        Ok(())
    }
}
