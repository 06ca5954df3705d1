//! Setup file
//!
//! ```text
//! [emulator]
//! file = topology.graphml
//! netns = lab-        ; unique prefixes of option names are accepted
//!
//! [edge1]
//! ip = 192.168.1.20
//! iface = eth1
//! ```
//!
//! Keys of the `[emulator]` group are long command line option names. Every
//! group whose name starts with `edge` or `node` defines one edge node.

use super::{Cli, ConfigError, EdgeSpec};
use crate::logging::Verbosity;
use graphml::BandwidthUnits;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub line: usize,
    pub key: String,
    pub value: String,
}

/// Parsed contents of a setup file, before option names are resolved
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetupFile {
    pub emulator: Vec<Entry>,
    pub edges: Vec<EdgeSpec>,
}

type Setter = fn(&mut Cli, &str) -> Result<(), String>;

fn parse<T: FromStr>(value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| e.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".into()),
    }
}

/// Parse `value` and store it unless the command line already set the option
fn fill<T>(slot: &mut Option<T>, value: Result<T, String>) -> Result<(), String> {
    let value = value?;
    if slot.is_none() {
        *slot = Some(value);
    }
    Ok(())
}

/// Options that may appear in the `[emulator]` group
fn setters() -> [(&'static str, Setter); 16] {
    [
        ("file", |c, v| fill(&mut c.file, Ok(PathBuf::from(v)))),
        ("destroy", |c, v| {
            c.destroy |= parse_bool(v)?;
            Ok(())
        }),
        ("iface", |c, v| fill(&mut c.iface, Ok(v.to_string()))),
        ("vsubnet", |c, v| fill(&mut c.vsubnet, netaddr::parse_cidr(v).map_err(|e| e.to_string()))),
        ("edge-node", |c, v| {
            c.edge_nodes.push(parse::<EdgeSpec>(v)?);
            Ok(())
        }),
        ("verbosity", |c, v| fill(&mut c.verbosity, parse::<Verbosity>(v))),
        ("log-file", |c, v| fill(&mut c.log_file, Ok(PathBuf::from(v)))),
        ("netns-prefix", |c, v| fill(&mut c.netns_prefix, Ok(v.to_string()))),
        ("ovs-dir", |c, v| fill(&mut c.ovs_dir, Ok(PathBuf::from(v)))),
        ("ovs-schema", |c, v| fill(&mut c.ovs_schema, Ok(PathBuf::from(v)))),
        ("mem", |c, v| fill(&mut c.mem, parse::<usize>(v))),
        ("units", |c, v| fill(&mut c.units, parse::<BandwidthUnits>(v))),
        ("weight", |c, v| fill(&mut c.weight, Ok(v.to_string()))),
        ("client-node", |c, v| fill(&mut c.client_node, Ok(v.to_string()))),
        ("two-pass", |c, v| {
            c.two_pass |= parse_bool(v)?;
            Ok(())
        }),
        ("edge-commands", |c, v| fill(&mut c.edge_commands, Ok(PathBuf::from(v)))),
    ]
}

/// Find the option named by `key`, accepting any unambiguous prefix
pub fn resolve(key: &str) -> Result<(&'static str, Setter), ConfigError> {
    let table = setters();
    if let Some(exact) = table.iter().find(|(name, _)| *name == key) {
        return Ok(*exact);
    }
    let matches: Vec<_> = table.iter().filter(|(name, _)| name.starts_with(key)).collect();
    match matches.as_slice() {
        [] => Err(ConfigError::UnknownOption(key.to_string())),
        [only] => Ok(**only),
        many => Err(ConfigError::AmbiguousOption {
            key: key.to_string(),
            candidates: many.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", "),
        }),
    }
}

fn finish_edge(path: &Path, line: usize, props: Vec<(usize, String, String)>) -> Result<EdgeSpec, ConfigError> {
    let syntax = |line: usize, message: String| ConfigError::Syntax {
        path: path.to_path_buf(),
        line,
        message,
    };
    let ip = props
        .iter()
        .find(|(_, key, _)| key == "ip")
        .ok_or_else(|| syntax(line, "edge group has no ip".into()))?;
    let mut edge = EdgeSpec::new(netaddr::parse_ipv4(&ip.2).map_err(|e| syntax(ip.0, e.to_string()))?);
    for (line, key, value) in props {
        edge.set(&key, &value).map_err(|e| syntax(line, e))?;
    }
    Ok(edge)
}

enum Group {
    None,
    Emulator,
    Edge { line: usize, props: Vec<(usize, String, String)> },
}

impl SetupFile {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let syntax = |line: usize, message: String| ConfigError::Syntax {
            path: path.to_path_buf(),
            line,
            message,
        };
        let mut file = SetupFile::default();
        let mut group = Group::None;

        for (number, raw) in text.lines().enumerate() {
            let line = number + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') || content.starts_with(';') {
                continue;
            }

            if let Some(name) = content.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| syntax(line, "unterminated group header".into()))?
                    .trim();
                if let Group::Edge { line, props } = std::mem::replace(&mut group, Group::None) {
                    file.edges.push(finish_edge(path, line, props)?);
                }
                group = if name == "emulator" {
                    Group::Emulator
                } else if name.starts_with("edge") || name.starts_with("node") {
                    Group::Edge {
                        line,
                        props: Vec::new(),
                    }
                } else {
                    return Err(syntax(line, format!("unknown group [{}]", name)));
                };
                continue;
            }

            let (key, value) = content
                .split_once('=')
                .ok_or_else(|| syntax(line, format!("expected key = value, got '{}'", content)))?;
            let key = key.trim().to_string();
            let value = strip_comment(value).trim().trim_matches('"').to_string();
            match &mut group {
                Group::None => return Err(syntax(line, format!("'{}' is outside of any group", key))),
                Group::Emulator => file.emulator.push(Entry { line, key, value }),
                Group::Edge { props, .. } => props.push((line, key, value)),
            }
        }
        if let Group::Edge { line, props } = group {
            file.edges.push(finish_edge(path, line, props)?);
        }
        Ok(file)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Merge into `cli`, keeping every option the command line already set.
    /// Edges from the file come before those of the command line.
    pub fn apply(self, cli: &mut Cli) -> Result<(), ConfigError> {
        let from_cli = std::mem::take(&mut cli.edge_nodes);
        for entry in self.emulator {
            let (name, setter) = resolve(&entry.key)?;
            setter(cli, &entry.value).map_err(|reason| ConfigError::InvalidValue {
                option: name.to_string(),
                value: entry.value.clone(),
                reason,
            })?;
        }
        let mut edges = self.edges;
        edges.append(&mut cli.edge_nodes);
        edges.extend(from_cli);
        cli.edge_nodes = edges;
        Ok(())
    }
}

/// Drop a trailing `;` or `#` comment
fn strip_comment(value: &str) -> &str {
    match value.find([';', '#']) {
        Some(pos) => &value[..pos],
        None => value,
    }
}
