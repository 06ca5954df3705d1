//! Edge bookkeeping that needs no privileges: subnet assignment, client
//! distribution and the command lines for the edge companion tool.

use crate::config::EdgeSpec;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Name of the companion tool run on each edge machine
pub const EDGE_TOOL: &str = "netmirage-edge";

/// Give every edge a client subnet. Edges without one share `global`, split
/// into as many fragments as there are such edges.
pub fn assign_vsubnets(edges: &[EdgeSpec], global: Ipv4Network) -> Result<Vec<Ipv4Network>> {
    let missing = edges.iter().filter(|e| e.vsubnet.is_none()).count();
    let mut fragments = Vec::new();
    if missing > 0 {
        for explicit in edges.iter().filter_map(|e| e.vsubnet) {
            if global.contains(explicit.network()) || explicit.contains(global.network()) {
                return Err(crate::ConfigError::OverlappingSubnets(global, explicit).into());
            }
        }
        fragments = netaddr::fragment(&global, missing as u32)
            .ok_or_else(|| Error::Exhausted(format!("addresses in {} for {} edges", global, missing)))?;
    }
    let mut shared = fragments.into_iter();

    edges
        .iter()
        .map(|e| match e.vsubnet {
            Some(net) => Ok(net),
            None => shared
                .next()
                .ok_or_else(|| Error::Internal("fragment count mismatch".into())),
        })
        .collect()
}

/// Number of clients each of `edges` edges receives. Remainders are spread so
/// that edge `i` gets `round((i+1)c) - round(ic)` with `c = clients / edges`.
pub fn client_counts(clients: usize, edges: usize) -> Vec<usize> {
    if edges == 0 {
        return Vec::new();
    }
    let per_edge = clients as f64 / edges as f64;
    (0..edges)
        .map(|i| {
            let lo = (i as f64 * per_edge).round() as usize;
            let hi = ((i + 1) as f64 * per_edge).round() as usize;
            hi - lo
        })
        .collect()
}

/// Command line for the edge tool. Values only the operator knows are left
/// as placeholders.
pub fn edge_command(others: &[Ipv4Network], clients: usize, core_ip: Option<Ipv4Addr>, vsubnet: Ipv4Network) -> String {
    let mut words = vec![EDGE_TOOL.to_string()];
    for other in others {
        words.push("-e".into());
        words.push(other.to_string());
    }
    words.push("-c".into());
    words.push(clients.to_string());
    words.push("<iface>".into());
    words.push(core_ip.map_or_else(|| "<core-ip>".to_string(), |ip| ip.to_string()));
    words.push(vsubnet.to_string());
    words.push("<applications>".into());
    words.join(" ")
}
