use super::CommandSink;
use crate::worker::{Command, InternalRoute};
use crate::Result;
use ipnetwork::Ipv4Network;
use route_planner::RoutePlanner;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Install static routes along the planned path of every ordered client pair.
/// `ips` maps node ids to addresses. Returns the number of routes submitted;
/// hops shared by several paths are submitted again and the worker tolerates
/// the duplicates.
///
/// Each pair is visited once and routed in both directions, `a` to `b` along
/// `route(a, b)` and `b` to `a` along `route(b, a)`. Every hop towards a client
/// is therefore the planner's next hop towards that client, whichever pair
/// submitted it.
pub fn install_routes<S: CommandSink>(
    sink: &mut S,
    planner: &mut RoutePlanner,
    clients: &[(u32, Ipv4Network)],
    ips: &[Ipv4Addr],
) -> Result<usize> {
    let mut submitted = 0;
    let mut unreachable = 0;
    for (i, &(a, a_subnet)) in clients.iter().enumerate() {
        for &(b, b_subnet) in &clients[i + 1..] {
            match route_towards(sink, planner, a, b, b_subnet, ips)? {
                Some(count) => submitted += count,
                None => {
                    unreachable += 1;
                    warn!("No path between nodes {} and {}", a, b);
                    continue;
                }
            }
            submitted += route_towards(sink, planner, b, a, a_subnet, ips)?.unwrap_or(0);
        }
    }
    if unreachable > 0 {
        warn!("{} client pairs cannot reach each other", unreachable);
    }
    info!("Submitted {} routes for {} clients", submitted, clients.len());
    Ok(submitted)
}

/// Route `dst` at every node on the path from `from` to `to`
fn route_towards<S: CommandSink>(
    sink: &mut S,
    planner: &mut RoutePlanner,
    from: u32,
    to: u32,
    dst: Ipv4Network,
    ips: &[Ipv4Addr],
) -> Result<Option<usize>> {
    let Some(path) = planner.route(from, to) else {
        return Ok(None);
    };
    for hop in path.windows(2) {
        let (u, v) = (hop[0], hop[1]);
        sink.submit(Command::AddInternalRoute(InternalRoute {
            node: u,
            peer: v,
            dst,
            gateway: ips[v as usize],
        }))?;
    }
    Ok(Some(path.len() - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(1, 0, 0, last)
    }

    #[test]
    fn test_routes_follow_shortest_path() {
        // Triangle of clients 0, 1, 2 where 0-2 is cheapest through 1
        let mut planner = RoutePlanner::new(3).unwrap();
        for (a, b, w) in [(0, 1, 10.0), (1, 2, 20.0), (0, 2, 100.0)] {
            planner.set_weight(a, b, w).unwrap();
            planner.set_weight(b, a, w).unwrap();
        }
        planner.plan();

        let clients = [(0, net("10.0.0.0/24")), (1, net("10.0.1.0/24")), (2, net("10.0.2.0/24"))];
        let ips = [ip(0), ip(1), ip(2)];
        let mut sink = Vec::new();
        let count = install_routes(&mut sink, &mut planner, &clients, &ips).unwrap();
        // Pairs 0-1 and 1-2 have one hop, 0-2 has two
        assert_eq!(count, 8);
        assert_eq!(sink.len(), 8);

        let routes: Vec<InternalRoute> = sink
            .into_iter()
            .map(|c| match c {
                Command::AddInternalRoute(r) => r,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        // Node 0 reaches client 2 through node 1
        assert!(routes.contains(&InternalRoute {
            node: 0,
            peer: 1,
            dst: net("10.0.2.0/24"),
            gateway: ip(1),
        }));
        // And node 2 answers through node 1 as well
        assert!(routes.contains(&InternalRoute {
            node: 2,
            peer: 1,
            dst: net("10.0.0.0/24"),
            gateway: ip(1),
        }));
        assert!(!routes.iter().any(|r| r.node == 0 && r.peer == 2));
    }

    #[test]
    fn test_unreachable_pairs_are_skipped() {
        let mut planner = RoutePlanner::new(3).unwrap();
        planner.set_weight(0, 1, 5.0).unwrap();
        planner.set_weight(1, 0, 5.0).unwrap();
        planner.plan();

        let clients = [(0, net("10.0.0.0/24")), (1, net("10.0.1.0/24")), (2, net("10.0.2.0/24"))];
        let mut sink = Vec::new();
        let count = install_routes(&mut sink, &mut planner, &clients, &[ip(0), ip(1), ip(2)]).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_hops_agree_with_planner_on_ties() {
        // Square 0-1-3 and 0-2-3 of equal weight, plus a spur 3-4
        let mut planner = RoutePlanner::new(5).unwrap();
        for (a, b) in [(0, 1), (1, 3), (0, 2), (2, 3), (3, 4)] {
            planner.set_weight(a, b, 1.0).unwrap();
            planner.set_weight(b, a, 1.0).unwrap();
        }
        planner.plan();

        let subnets = [net("10.0.0.0/24"), net("10.0.1.0/24"), net("10.0.2.0/24")];
        let clients = [(0, subnets[0]), (3, subnets[1]), (4, subnets[2])];
        let ips: Vec<_> = (0..5).map(ip).collect();
        let mut sink = Vec::new();
        install_routes(&mut sink, &mut planner, &clients, &ips).unwrap();

        for command in sink {
            let Command::AddInternalRoute(r) = command else {
                panic!("unexpected {:?}", command);
            };
            let (dst, _) = clients.iter().find(|(_, s)| *s == r.dst).unwrap();
            let next = planner.route(r.node, *dst).unwrap()[1];
            assert_eq!(r.peer, next, "node {} towards {}", r.node, r.dst);
            assert_eq!(r.gateway, ip(next as u8));
        }
    }
}
