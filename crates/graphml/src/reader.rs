use crate::{GraphmlError, Link, LinkParams, Node, ReadStats, ReaderOptions, TopologyVisitor};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Which records a read reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    All,
    NodesOnly,
    LinksOnly,
}

impl Pass {
    fn nodes(self) -> bool {
        matches!(self, Pass::All | Pass::NodesOnly)
    }

    fn links(self) -> bool {
        matches!(self, Pass::All | Pass::LinksOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Node,
    Edge,
    All,
    Other,
}

#[derive(Debug)]
struct KeyDecl {
    domain: Domain,
    name: String,
    default: Option<String>,
}

enum Element {
    Node {
        id: String,
    },
    Edge {
        source: String,
        target: String,
    },
}

#[derive(Default)]
struct State {
    keys: HashMap<String, KeyDecl>,
    /// Key currently being declared, for `<default>` children
    open_key: Option<String>,
    in_default: bool,
    directed_default: bool,
    element: Option<Element>,
    data: HashMap<String, String>,
    /// Attribute name of the `<data>` being read
    open_data: Option<String>,
    text: String,
    nodes: usize,
    links: usize,
}

fn xml_err<R>(reader: &Reader<R>, source: quick_xml::Error) -> GraphmlError {
    GraphmlError::Xml {
        position: reader.buffer_position() as u64,
        source,
    }
}

fn attributes<R>(reader: &Reader<R>, e: &BytesStart<'_>) -> Result<HashMap<String, String>, GraphmlError> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| xml_err(reader, err.into()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| xml_err(reader, err))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn parse_f64(key: &str, value: &str) -> Result<f64, GraphmlError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| GraphmlError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, GraphmlError> {
    value.trim().parse::<u32>().map_err(|_| GraphmlError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl State {
    /// Attribute value from the element's `<data>` or the key's default
    fn value(&self, domain: Domain, name: &str) -> Option<&str> {
        if let Some(v) = self.data.get(name) {
            return Some(v.as_str());
        }
        self.keys
            .values()
            .find(|k| k.name == name && (k.domain == domain || k.domain == Domain::All))
            .and_then(|k| k.default.as_deref())
    }

    fn number(&self, domain: Domain, name: &str) -> Result<Option<f64>, GraphmlError> {
        self.value(domain, name).map(|v| parse_f64(name, v)).transpose()
    }

    fn build_node(&self, id: String, options: &ReaderOptions) -> Result<Node, GraphmlError> {
        let client = self
            .value(Domain::Node, "type")
            .is_some_and(|t| t.trim() == options.client_type);
        let bandwidth = |name: &str| -> Result<f64, GraphmlError> {
            Ok(self
                .number(Domain::Node, name)?
                .map(|v| options.units.to_mbit(v))
                .unwrap_or(0.0))
        };
        Ok(Node {
            name: id,
            client,
            packet_loss: self.number(Domain::Node, "packetloss")?.unwrap_or(0.0),
            bandwidth_up: bandwidth("bandwidthup")?,
            bandwidth_down: bandwidth("bandwidthdown")?,
        })
    }

    /// A shared attribute with optional `up`/`down` overrides
    fn split(&self, name: &str) -> Result<(Option<f64>, Option<f64>), GraphmlError> {
        let both = self.number(Domain::Edge, name)?;
        let up = self.number(Domain::Edge, &format!("{}up", name))?.or(both);
        let down = self.number(Domain::Edge, &format!("{}down", name))?.or(both);
        Ok((up, down))
    }

    fn build_link(&self, source: String, target: String, options: &ReaderOptions) -> Result<Link, GraphmlError> {
        let (latency_up, latency_down) = self.split("latency")?;
        let (jitter_up, jitter_down) = self.split("jitter")?;
        let (loss_up, loss_down) = self.split("packetloss")?;

        let queue = |name: &str| -> Result<Option<u32>, GraphmlError> {
            self.value(Domain::Edge, name).map(|v| parse_u32(name, v)).transpose()
        };
        let queue_both = queue("queue_len")?;
        let queue_up = queue("queue_lenup")?.or(queue_both);
        let queue_down = queue("queue_lendown")?.or(queue_both);

        let key = options.weight_key.as_str();
        let weight = match self.number(Domain::Edge, key)? {
            Some(w) => w,
            None => {
                let up = self.number(Domain::Edge, &format!("{}up", key))?;
                let down = self.number(Domain::Edge, &format!("{}down", key))?;
                match (up, down) {
                    (Some(u), Some(d)) => (u + d) / 2.0,
                    (Some(w), None) | (None, Some(w)) => w,
                    (None, None) => {
                        return Err(GraphmlError::MissingWeight {
                            source,
                            target,
                            key: key.to_string(),
                        })
                    }
                }
            }
        };

        Ok(Link {
            source,
            target,
            weight,
            up: LinkParams {
                latency: latency_up.unwrap_or(0.0),
                jitter: jitter_up.unwrap_or(0.0),
                packet_loss: loss_up.unwrap_or(0.0),
                queue_len: queue_up.unwrap_or(0),
            },
            down: LinkParams {
                latency: latency_down.unwrap_or(0.0),
                jitter: jitter_down.unwrap_or(0.0),
                packet_loss: loss_down.unwrap_or(0.0),
                queue_len: queue_down.unwrap_or(0),
            },
        })
    }

    fn open<R>(&mut self, reader: &Reader<R>, e: &BytesStart<'_>, pass: Pass) -> Result<(), GraphmlError> {
        match e.local_name().as_ref() {
            b"key" => {
                let mut attrs = attributes(reader, e)?;
                let id = attrs
                    .remove("id")
                    .ok_or_else(|| GraphmlError::Malformed("<key> without id".into()))?;
                let name = attrs.remove("attr.name").unwrap_or_else(|| id.clone());
                let domain = match attrs.get("for").map(String::as_str) {
                    Some("node") => Domain::Node,
                    Some("edge") => Domain::Edge,
                    Some("all") | None => Domain::All,
                    Some(_) => Domain::Other,
                };
                self.keys.insert(
                    id.clone(),
                    KeyDecl {
                        domain,
                        name,
                        default: None,
                    },
                );
                self.open_key = Some(id);
            }
            b"default" if self.open_key.is_some() => {
                self.in_default = true;
                self.text.clear();
            }
            b"graph" => {
                let attrs = attributes(reader, e)?;
                self.directed_default = attrs.get("edgedefault").map(String::as_str) == Some("directed");
            }
            b"node" => {
                let id = attributes(reader, e)?
                    .remove("id")
                    .ok_or(GraphmlError::AnonymousNode)?;
                self.data.clear();
                self.element = Some(Element::Node { id });
            }
            b"edge" => {
                let mut attrs = attributes(reader, e)?;
                let source = attrs.remove("source").ok_or(GraphmlError::MissingEndpoint("source"))?;
                let target = attrs.remove("target").ok_or(GraphmlError::MissingEndpoint("target"))?;
                let directed = match attrs.get("directed").map(String::as_str) {
                    Some("true") => true,
                    Some("false") => false,
                    _ => self.directed_default,
                };
                // Checked in every pass so a two-pass read fails before any kernel work
                if directed {
                    return Err(GraphmlError::DirectedEdge { source, target });
                }
                self.data.clear();
                self.element = Some(Element::Edge { source, target });
            }
            b"data" if self.element.is_some() => {
                let key = attributes(reader, e)?
                    .remove("key")
                    .ok_or_else(|| GraphmlError::Malformed("<data> without key".into()))?;
                let wanted = match &self.element {
                    Some(Element::Node { .. }) => pass.nodes(),
                    _ => pass.links(),
                };
                self.open_data = if wanted {
                    Some(self.keys.get(&key).map(|k| k.name.clone()).unwrap_or(key))
                } else {
                    None
                };
                self.text.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn close<V: TopologyVisitor>(
        &mut self,
        name: &[u8],
        pass: Pass,
        options: &ReaderOptions,
        visitor: &mut V,
    ) -> Result<(), V::Error> {
        match name {
            b"key" => self.open_key = None,
            b"default" if self.in_default => {
                self.in_default = false;
                if let Some(decl) = self.open_key.as_ref().and_then(|id| self.keys.get_mut(id)) {
                    decl.default = Some(std::mem::take(&mut self.text));
                }
            }
            b"data" => {
                if let Some(attr) = self.open_data.take() {
                    self.data.insert(attr, std::mem::take(&mut self.text));
                }
            }
            b"node" => {
                if let Some(Element::Node { id }) = self.element.take() {
                    self.nodes += 1;
                    if pass.nodes() {
                        let node = self.build_node(id, options)?;
                        visitor.on_node(&node)?;
                    }
                }
            }
            b"edge" => {
                if let Some(Element::Edge { source, target }) = self.element.take() {
                    self.links += 1;
                    if pass.links() {
                        let link = self.build_link(source, target, options)?;
                        visitor.on_link(&link)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Stream a GraphML document from `source`, reporting the records selected by
/// `pass` to `visitor`.
pub fn read<R: BufRead, V: TopologyVisitor>(
    source: R,
    options: &ReaderOptions,
    pass: Pass,
    visitor: &mut V,
) -> Result<ReadStats, V::Error> {
    let mut reader = Reader::from_reader(source);
    reader.config_mut().trim_text(true);

    let mut state = State::default();
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_err(&reader, e))?;
        match event {
            Event::Start(e) => state.open(&reader, &e, pass)?,
            Event::Empty(e) => {
                state.open(&reader, &e, pass)?;
                let name = e.local_name().as_ref().to_vec();
                state.close(&name, pass, options, visitor)?;
            }
            Event::End(e) => {
                let name = e.local_name().as_ref().to_vec();
                state.close(&name, pass, options, visitor)?;
            }
            Event::Text(t) if state.open_data.is_some() || state.in_default => {
                let text = t.unescape().map_err(|e| xml_err(&reader, e))?;
                state.text.push_str(&text);
            }
            Event::CData(t) if state.open_data.is_some() || state.in_default => {
                state.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    debug!(
        "Read {} nodes and {} links ({:?})",
        state.nodes, state.links, pass
    );
    Ok(ReadStats {
        nodes: state.nodes,
        links: state.links,
    })
}

/// Read a topology file. With `two_pass`, the file is streamed once for nodes
/// and again for links, so edges may precede the nodes they reference; the
/// visitor learns the totals through [`TopologyVisitor::on_nodes_complete`]
/// between the passes.
pub fn read_file<V: TopologyVisitor>(
    path: &Path,
    options: &ReaderOptions,
    two_pass: bool,
    visitor: &mut V,
) -> Result<ReadStats, V::Error> {
    let open = || -> Result<BufReader<File>, GraphmlError> { Ok(BufReader::new(File::open(path)?)) };
    if two_pass {
        let stats = read(open()?, options, Pass::NodesOnly, visitor)?;
        visitor.on_nodes_complete(&stats)?;
        read(open()?, options, Pass::LinksOnly, visitor)
    } else {
        read(open()?, options, Pass::All, visitor)
    }
}
