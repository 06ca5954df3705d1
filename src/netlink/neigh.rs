use super::consts::*;
use super::message::{read_ipv4, Attributes, MessageBuilder};
use super::{NetlinkError, NetlinkSocket};
use byteorder::{ByteOrder, NativeEndian};
use netaddr::MacAddr;
use nix::errno::Errno;
use std::net::Ipv4Addr;

const NDMSG_LEN: usize = 12;

fn ndmsg(index: u32, state: u16) -> [u8; NDMSG_LEN] {
    let mut hdr = [0u8; NDMSG_LEN];
    hdr[0] = AF_INET;
    NativeEndian::write_u32(&mut hdr[4..8], index);
    NativeEndian::write_u16(&mut hdr[8..10], state);
    hdr
}

const USABLE_STATES: u16 = NUD_REACHABLE | NUD_STALE | NUD_DELAY | NUD_PROBE | NUD_PERMANENT | NUD_NOARP;

/// Scans a neighbour dump for the usable entry of one address
#[derive(Debug)]
struct NeighborLookup {
    index: u32,
    ip: Ipv4Addr,
    found: Option<MacAddr>,
}

impl NeighborLookup {
    fn new(index: u32, ip: Ipv4Addr) -> Self {
        Self { index, ip, found: None }
    }

    fn on_msg(&mut self, kind: u16, payload: &[u8]) {
        if self.found.is_some() || kind != RTM_NEWNEIGH || payload.len() < NDMSG_LEN {
            return;
        }
        let ifindex = NativeEndian::read_u32(&payload[4..8]);
        let state = NativeEndian::read_u16(&payload[8..10]);
        if ifindex != self.index || state & USABLE_STATES == 0 {
            return;
        }
        let mut dst = None;
        let mut lladdr = None;
        for (attr, value) in Attributes::new(&payload[NDMSG_LEN..]) {
            match attr {
                NDA_DST => dst = read_ipv4(value),
                NDA_LLADDR => lladdr = MacAddr::from_slice(value),
                _ => {}
            }
        }
        if dst == Some(self.ip) {
            self.found = lladdr.filter(|m| !m.is_zero());
        }
    }

    /// A miss is `EAGAIN` so that callers can probe and retry
    fn finish(self) -> Result<MacAddr, NetlinkError> {
        self.found.ok_or(NetlinkError::Kernel {
            op: "lookup neighbor",
            errno: Errno::EAGAIN,
        })
    }
}

fn add_message(index: u32, ip: Ipv4Addr, mac: MacAddr) -> MessageBuilder {
    let mut msg = MessageBuilder::new(RTM_NEWNEIGH, NLM_F_CREATE | NLM_F_REPLACE);
    msg.append(&ndmsg(index, NUD_PERMANENT));
    msg.attr_ipv4(NDA_DST, ip);
    msg.attr(NDA_LLADDR, &mac.octets());
    msg
}

impl NetlinkSocket {
    /// Install a permanent ARP entry
    pub fn add_neighbor(&mut self, index: u32, ip: Ipv4Addr, mac: MacAddr) -> Result<(), NetlinkError> {
        self.request("add neighbor", add_message(index, ip, mac))
    }

    /// Look `ip` up in the ARP cache of interface `index`. A miss is reported
    /// as `EAGAIN` so that callers can probe and retry.
    pub fn neighbor_mac(&mut self, index: u32, ip: Ipv4Addr) -> Result<MacAddr, NetlinkError> {
        let mut msg = MessageBuilder::new(RTM_GETNEIGH, 0);
        msg.append(&ndmsg(0, 0));

        let mut lookup = NeighborLookup::new(index, ip);
        self.dump("lookup neighbor", msg, |kind, payload| {
            lookup.on_msg(kind, payload);
            Ok(())
        })?;
        lookup.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::Messages;

    const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);

    fn entry(index: u32, state: u16, ip: Ipv4Addr, mac: &[u8]) -> Vec<u8> {
        let mut msg = MessageBuilder::new(RTM_NEWNEIGH, NLM_F_MULTI);
        msg.append(&ndmsg(index, state));
        msg.attr_ipv4(NDA_DST, ip);
        msg.attr(NDA_LLADDR, mac);
        msg.finish(9, 0).unwrap()
    }

    /// One datagram of a neighbour dump, terminated by `NLMSG_DONE`
    fn dump(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut buf: Vec<u8> = entries.concat();
        let mut done = MessageBuilder::new(NLMSG_DONE, NLM_F_MULTI);
        done.append(&0i32.to_ne_bytes());
        buf.extend(done.finish(9, 0).unwrap());
        buf
    }

    fn lookup(buf: &[u8], index: u32) -> Result<MacAddr, NetlinkError> {
        let mut lookup = NeighborLookup::new(index, GATEWAY);
        for msg in Messages::new(buf) {
            let (header, payload) = msg.unwrap();
            lookup.on_msg(header.kind, payload);
        }
        lookup.finish()
    }

    #[test]
    fn test_lookup_filters_dump() {
        let mac = [0x52, 0x54, 0, 0xab, 0xcd, 0xef];
        let buf = dump(&[
            entry(3, NUD_REACHABLE, GATEWAY, &[0x52, 0x54, 0, 0, 0, 1]),
            entry(2, libc::NUD_INCOMPLETE, GATEWAY, &[0x52, 0x54, 0, 0, 0, 2]),
            entry(2, NUD_REACHABLE, Ipv4Addr::new(192, 168, 0, 3), &[0x52, 0x54, 0, 0, 0, 3]),
            entry(2, NUD_STALE, GATEWAY, &mac),
        ]);

        assert_eq!(lookup(&buf, 2).unwrap(), MacAddr::from_slice(&mac).unwrap());
        assert_eq!(lookup(&buf, 3).unwrap().octets(), [0x52, 0x54, 0, 0, 0, 1]);
    }

    #[test]
    fn test_miss_is_eagain() {
        let buf = dump(&[
            entry(2, libc::NUD_FAILED, GATEWAY, &[0x52, 0x54, 0, 0, 0, 9]),
            entry(2, NUD_REACHABLE, GATEWAY, &[0; 6]),
        ]);
        let err = lookup(&buf, 2).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
        assert!(lookup(&dump(&[]), 2).is_err());
    }

    #[test]
    fn test_permanent_entry_message() {
        let mac: MacAddr = "02:00:00:00:00:07".parse().unwrap();
        let msg = add_message(5, GATEWAY, mac);
        assert_eq!(msg.flags(), NLM_F_CREATE | NLM_F_REPLACE);
        let bytes = msg.finish(1, 0).unwrap();
        let (header, payload) = Messages::new(&bytes).next().unwrap().unwrap();
        assert_eq!(header.kind, RTM_NEWNEIGH);
        assert_eq!(payload[0], AF_INET);
        assert_eq!(NativeEndian::read_u32(&payload[4..8]), 5);
        assert_eq!(NativeEndian::read_u16(&payload[8..10]), NUD_PERMANENT);

        let attrs: Vec<(u16, Vec<u8>)> = Attributes::new(&payload[NDMSG_LEN..])
            .map(|(k, v)| (k, v.to_vec()))
            .collect();
        assert_eq!(attrs[0].0, NDA_DST);
        assert_eq!(read_ipv4(&attrs[0].1), Some(GATEWAY));
        assert_eq!(attrs[1], (NDA_LLADDR, mac.octets().to_vec()));
    }
}
