use super::consts::*;
use super::message::{read_str, read_u32, Attributes, MessageBuilder};
use super::{NetlinkError, NetlinkSocket};
use byteorder::{ByteOrder, NativeEndian};
use netaddr::MacAddr;
use std::os::fd::{AsRawFd, BorrowedFd};
use tracing::debug;

const IFINFOMSG_LEN: usize = 16;

/// `struct ifinfomsg` for a given interface index
fn ifinfomsg(index: u32) -> [u8; IFINFOMSG_LEN] {
    let mut hdr = [0u8; IFINFOMSG_LEN];
    hdr[0] = AF_UNSPEC;
    NativeEndian::write_u32(&mut hdr[4..8], index);
    hdr
}

/// One end of a veth pair
#[derive(Debug, Clone, Copy)]
pub struct VethEnd<'a> {
    pub name: &'a str,
    pub mac: MacAddr,
    /// Namespace the end is placed in
    pub netns: BorrowedFd<'a>,
}

impl VethEnd<'_> {
    fn write(&self, msg: &mut MessageBuilder, mtu: Option<u32>) {
        msg.attr_str(IFLA_IFNAME, self.name);
        msg.attr(IFLA_ADDRESS, &self.mac.octets());
        if let Some(mtu) = mtu {
            msg.attr_u32(IFLA_MTU, mtu);
        }
        msg.attr_u32(IFLA_NET_NS_FD, self.netns.as_raw_fd() as u32);
    }
}

/// Interface attributes reported by a link dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub mac: Option<MacAddr>,
}

fn veth_message(end: &VethEnd<'_>, peer: &VethEnd<'_>, mtu: Option<u32>) -> Result<MessageBuilder, NetlinkError> {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL);
    msg.append(&ifinfomsg(0));
    end.write(&mut msg, mtu);

    msg.push_attr(IFLA_LINKINFO)?;
    msg.attr_str(IFLA_INFO_KIND, "veth");
    msg.push_attr(IFLA_INFO_DATA)?;
    msg.push_attr(VETH_INFO_PEER)?;
    msg.append(&ifinfomsg(0));
    peer.write(&mut msg, mtu);
    msg.pop_attr()?;
    msg.pop_attr()?;
    msg.pop_attr()?;
    Ok(msg)
}

fn move_message(index: u32, netns: BorrowedFd<'_>) -> MessageBuilder {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, 0);
    msg.append(&ifinfomsg(index));
    msg.attr_u32(IFLA_NET_NS_FD, netns.as_raw_fd() as u32);
    msg
}

fn delete_message(index: u32) -> MessageBuilder {
    let mut msg = MessageBuilder::new(RTM_DELLINK, 0);
    msg.append(&ifinfomsg(index));
    msg
}

/// Decode one message of a link dump
fn parse_link(kind: u16, payload: &[u8]) -> Option<LinkInfo> {
    if kind != RTM_NEWLINK || payload.len() < IFINFOMSG_LEN {
        return None;
    }
    let mut info = LinkInfo {
        index: NativeEndian::read_u32(&payload[4..8]),
        name: String::new(),
        mtu: 0,
        mac: None,
    };
    for (attr, value) in Attributes::new(&payload[IFINFOMSG_LEN..]) {
        match attr {
            IFLA_IFNAME => info.name = read_str(value),
            IFLA_MTU => info.mtu = read_u32(value).unwrap_or(0),
            IFLA_ADDRESS => info.mac = MacAddr::from_slice(value),
            _ => {}
        }
    }
    Some(info)
}

impl NetlinkSocket {
    /// Create a veth pair whose ends land directly in their namespaces
    pub fn create_veth(&mut self, end: &VethEnd<'_>, peer: &VethEnd<'_>, mtu: Option<u32>) -> Result<(), NetlinkError> {
        debug!("Creating veth pair {} <-> {}", end.name, peer.name);
        self.request("create veth", veth_message(end, peer, mtu)?)
    }

    /// Move an interface of the current namespace into `netns`
    pub fn move_link(&mut self, index: u32, netns: BorrowedFd<'_>) -> Result<(), NetlinkError> {
        self.request("move link", move_message(index, netns))
    }

    pub fn delete_link(&mut self, index: u32) -> Result<(), NetlinkError> {
        self.request("delete link", delete_message(index))
    }

    /// All interfaces of the current namespace
    pub fn links(&mut self) -> Result<Vec<LinkInfo>, NetlinkError> {
        let mut msg = MessageBuilder::new(RTM_GETLINK, 0);
        msg.append(&ifinfomsg(0));

        let mut links = Vec::new();
        self.dump("list links", msg, |kind, payload| {
            links.extend(parse_link(kind, payload));
            Ok(())
        })?;
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::Messages;
    use std::fs::File;
    use std::os::fd::AsFd;

    fn attrs(buf: &[u8]) -> Vec<(u16, Vec<u8>)> {
        Attributes::new(buf).map(|(k, v)| (k, v.to_vec())).collect()
    }

    fn find(attrs: &[(u16, Vec<u8>)], kind: u16) -> &[u8] {
        &attrs
            .iter()
            .find(|(k, _)| *k == kind)
            .unwrap_or_else(|| panic!("attribute {} missing", kind))
            .1
    }

    fn assert_end(attrs: &[(u16, Vec<u8>)], name: &str, mac: MacAddr, fd: i32) {
        assert_eq!(read_str(find(attrs, IFLA_IFNAME)), name);
        assert_eq!(MacAddr::from_slice(find(attrs, IFLA_ADDRESS)), Some(mac));
        assert_eq!(read_u32(find(attrs, IFLA_MTU)), Some(9000));
        assert_eq!(read_u32(find(attrs, IFLA_NET_NS_FD)), Some(fd as u32));
    }

    #[test]
    fn test_veth_message_layout() {
        let left = File::open("/dev/null").unwrap();
        let right = File::open("/dev/null").unwrap();
        let left_mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let right_mac: MacAddr = "02:00:00:00:00:02".parse().unwrap();
        let end = VethEnd {
            name: "node-1",
            mac: left_mac,
            netns: left.as_fd(),
        };
        let peer = VethEnd {
            name: "node-0",
            mac: right_mac,
            netns: right.as_fd(),
        };

        let msg = veth_message(&end, &peer, Some(9000)).unwrap();
        assert_eq!(msg.kind(), RTM_NEWLINK);
        assert_eq!(msg.flags(), NLM_F_CREATE | NLM_F_EXCL);
        let bytes = msg.finish(1, 0).unwrap();
        let (_, payload) = Messages::new(&bytes).next().unwrap().unwrap();

        assert_eq!(payload[0], AF_UNSPEC);
        assert_eq!(NativeEndian::read_u32(&payload[4..8]), 0);
        let outer = attrs(&payload[IFINFOMSG_LEN..]);
        assert_end(&outer, "node-1", left_mac, left.as_raw_fd());

        let linkinfo = attrs(find(&outer, IFLA_LINKINFO));
        assert_eq!(read_str(find(&linkinfo, IFLA_INFO_KIND)), "veth");
        let data = attrs(find(&linkinfo, IFLA_INFO_DATA));
        let peer_info = find(&data, VETH_INFO_PEER);
        assert_eq!(peer_info[0], AF_UNSPEC);
        assert_eq!(NativeEndian::read_u32(&peer_info[4..8]), 0);
        assert_end(&attrs(&peer_info[IFINFOMSG_LEN..]), "node-0", right_mac, right.as_raw_fd());
    }

    #[test]
    fn test_move_and_delete_messages() {
        let ns = File::open("/dev/null").unwrap();
        let bytes = move_message(12, ns.as_fd()).finish(1, 0).unwrap();
        let (header, payload) = Messages::new(&bytes).next().unwrap().unwrap();
        assert_eq!(header.kind, RTM_NEWLINK);
        assert_eq!(header.flags & NLM_F_CREATE, 0);
        assert_eq!(NativeEndian::read_u32(&payload[4..8]), 12);
        let moved = attrs(&payload[IFINFOMSG_LEN..]);
        assert_eq!(moved.len(), 1);
        assert_eq!(read_u32(find(&moved, IFLA_NET_NS_FD)), Some(ns.as_raw_fd() as u32));

        let bytes = delete_message(12).finish(2, 0).unwrap();
        let (header, payload) = Messages::new(&bytes).next().unwrap().unwrap();
        assert_eq!(header.kind, RTM_DELLINK);
        assert_eq!(payload.len(), IFINFOMSG_LEN);
        assert_eq!(NativeEndian::read_u32(&payload[4..8]), 12);
    }

    #[test]
    fn test_parse_link_dump_entry() {
        let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_MULTI);
        msg.append(&ifinfomsg(4));
        msg.attr_str(IFLA_IFNAME, "eth1");
        msg.attr_u32(IFLA_MTU, 1500);
        msg.attr(IFLA_ADDRESS, &[0x52, 0x54, 0, 0x12, 0x34, 0x56]);
        let bytes = msg.finish(3, 0).unwrap();
        let (header, payload) = Messages::new(&bytes).next().unwrap().unwrap();

        assert_eq!(
            parse_link(header.kind, payload),
            Some(LinkInfo {
                index: 4,
                name: "eth1".into(),
                mtu: 1500,
                mac: "52:54:00:12:34:56".parse().ok(),
            })
        );
        assert_eq!(parse_link(RTM_NEWADDR, payload), None);
        assert_eq!(parse_link(RTM_NEWLINK, &payload[..8]), None);
    }
}
