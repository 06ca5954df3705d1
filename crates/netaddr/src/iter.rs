//! Iteration over a subnet with excluded ranges

use crate::subnet::{subnet_end, subnet_start};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Enumerates every address of a subnet in ascending order, skipping any
/// address that falls inside one of the avoided subnets.
#[derive(Clone, Debug)]
pub struct Ip4Iter {
    next: u64,
    end: u64,
    /// Inclusive ranges sorted by (start asc, end desc)
    avoid: Vec<(u64, u64)>,
    avoid_pos: usize,
}

impl Ip4Iter {
    pub fn new(subnet: &Ipv4Network, avoid: &[Ipv4Network]) -> Self {
        let mut ranges: Vec<(u64, u64)> = avoid
            .iter()
            .map(|n| (u64::from(subnet_start(n)), u64::from(subnet_end(n))))
            .collect();
        ranges.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        Self {
            next: u64::from(subnet_start(subnet)),
            end: u64::from(subnet_end(subnet)),
            avoid: ranges,
            avoid_pos: 0,
        }
    }
}

impl Iterator for Ip4Iter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        loop {
            if self.next > self.end {
                return None;
            }
            while self.avoid_pos < self.avoid.len() && self.avoid[self.avoid_pos].1 < self.next {
                self.avoid_pos += 1;
            }
            match self.avoid.get(self.avoid_pos) {
                Some(&(start, end)) if start <= self.next => {
                    self.next = end + 1;
                }
                _ => {
                    let addr = self.next as u32;
                    self.next += 1;
                    return Some(Ipv4Addr::from(addr));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::parse_cidr;

    fn nets(list: &[&str]) -> Vec<Ipv4Network> {
        list.iter().map(|s| parse_cidr(s).unwrap()).collect()
    }

    #[test]
    fn test_single_hole() {
        let got: Vec<Ipv4Addr> =
            Ip4Iter::new(&parse_cidr("10.0.0.0/30").unwrap(), &nets(&["10.0.0.1/32"])).collect();
        assert_eq!(
            got,
            vec![
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3)
            ]
        );
    }

    #[test]
    fn test_nested_and_overlapping_holes() {
        let avoid = nets(&["10.0.0.4/30", "10.0.0.5/32", "10.0.0.6/31", "10.0.0.8/31", "10.0.0.0/32"]);
        let got: Vec<u8> = Ip4Iter::new(&parse_cidr("10.0.0.0/28").unwrap(), &avoid)
            .map(|a| a.octets()[3])
            .collect();
        assert_eq!(got, vec![1, 2, 3, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_matches_filtered_enumeration() {
        let subnet = parse_cidr("192.168.0.0/22").unwrap();
        let avoid = nets(&["192.168.0.128/25", "192.168.1.0/24", "192.168.1.77/32", "192.168.3.255/32"]);
        let expected: Vec<Ipv4Addr> = (subnet_start(&subnet)..=subnet_end(&subnet))
            .filter(|a| !avoid.iter().any(|n| n.contains(Ipv4Addr::from(*a))))
            .map(Ipv4Addr::from)
            .collect();
        let got: Vec<Ipv4Addr> = Ip4Iter::new(&subnet, &avoid).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_whole_space_skips_reserved() {
        let avoid = nets(&["0.0.0.0/8", "127.0.0.0/8", "255.255.255.255/32"]);
        let mut iter = Ip4Iter::new(&parse_cidr("0.0.0.0/0").unwrap(), &avoid);
        assert_eq!(iter.next(), Some(Ipv4Addr::new(1, 0, 0, 0)));

        let mut tail = Ip4Iter::new(&parse_cidr("255.255.255.252/30").unwrap(), &avoid);
        assert_eq!(tail.by_ref().last(), Some(Ipv4Addr::new(255, 255, 255, 254)));
    }

    #[test]
    fn test_fully_avoided() {
        let mut iter = Ip4Iter::new(&parse_cidr("10.0.0.0/24").unwrap(), &nets(&["10.0.0.0/8"]));
        assert_eq!(iter.next(), None);
    }
}
