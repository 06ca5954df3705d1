use super::consts::*;
use super::message::{read_ipv4, Attributes, MessageBuilder};
use super::{NetlinkError, NetlinkSocket};
use byteorder::{ByteOrder, NativeEndian};
use std::net::Ipv4Addr;

const IFADDRMSG_LEN: usize = 8;

fn ifaddrmsg(index: u32, prefix: u8) -> [u8; IFADDRMSG_LEN] {
    let mut hdr = [0u8; IFADDRMSG_LEN];
    hdr[0] = AF_INET;
    hdr[1] = prefix;
    hdr[3] = RT_SCOPE_UNIVERSE;
    NativeEndian::write_u32(&mut hdr[4..8], index);
    hdr
}

/// An IPv4 address assigned to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfAddr {
    pub index: u32,
    pub addr: Ipv4Addr,
    pub prefix: u8,
    pub broadcast: Option<Ipv4Addr>,
}

impl IfAddr {
    fn add_message(&self, anycast: Option<Ipv4Addr>) -> MessageBuilder {
        let mut msg = MessageBuilder::new(RTM_NEWADDR, NLM_F_CREATE | NLM_F_REPLACE);
        msg.append(&ifaddrmsg(self.index, self.prefix));
        msg.attr_ipv4(IFA_LOCAL, self.addr);
        msg.attr_ipv4(IFA_ADDRESS, self.addr);
        if let Some(broadcast) = self.broadcast {
            msg.attr_ipv4(IFA_BROADCAST, broadcast);
        }
        if let Some(anycast) = anycast {
            msg.attr_ipv4(IFA_ANYCAST, anycast);
        }
        msg
    }

    fn delete_message(&self) -> MessageBuilder {
        let mut msg = MessageBuilder::new(RTM_DELADDR, 0);
        msg.append(&ifaddrmsg(self.index, self.prefix));
        msg.attr_ipv4(IFA_LOCAL, self.addr);
        msg
    }
}

impl NetlinkSocket {
    pub fn add_address(&mut self, addr: &IfAddr, anycast: Option<Ipv4Addr>) -> Result<(), NetlinkError> {
        self.request("add address", addr.add_message(anycast))
    }

    pub fn delete_address(&mut self, addr: &IfAddr) -> Result<(), NetlinkError> {
        self.request("delete address", addr.delete_message())
    }

    /// IPv4 addresses of the current namespace, optionally for one interface
    pub fn addresses(&mut self, index: Option<u32>) -> Result<Vec<IfAddr>, NetlinkError> {
        let mut msg = MessageBuilder::new(RTM_GETADDR, 0);
        msg.append(&ifaddrmsg(0, 0));

        let mut addrs = Vec::new();
        self.dump("list addresses", msg, |kind, payload| {
            if kind != RTM_NEWADDR || payload.len() < IFADDRMSG_LEN || payload[0] != AF_INET {
                return Ok(());
            }
            let ifindex = NativeEndian::read_u32(&payload[4..8]);
            if index.is_some_and(|i| i != ifindex) {
                return Ok(());
            }
            let mut local = None;
            let mut address = None;
            let mut broadcast = None;
            for (attr, value) in Attributes::new(&payload[IFADDRMSG_LEN..]) {
                match attr {
                    IFA_LOCAL => local = read_ipv4(value),
                    IFA_ADDRESS => address = read_ipv4(value),
                    IFA_BROADCAST => broadcast = read_ipv4(value),
                    _ => {}
                }
            }
            if let Some(addr) = local.or(address) {
                addrs.push(IfAddr {
                    index: ifindex,
                    addr,
                    prefix: payload[1],
                    broadcast,
                });
            }
            Ok(())
        })?;
        Ok(addrs)
    }
}
