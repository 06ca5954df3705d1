use super::consts::*;
use super::message::MessageBuilder;
use super::{NetlinkError, NetlinkSocket};
use byteorder::{ByteOrder, NativeEndian};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

const RTMSG_LEN: usize = 12;
const FIB_RULE_HDR_LEN: usize = 12;

/// An IPv4 unicast route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    pub oif: u32,
    pub table: u32,
    pub scope: u8,
    /// Treat the gateway as directly reachable on `oif`
    pub onlink: bool,
}

impl Route {
    /// A route for `dst` through `gateway` on `oif` in the main table
    pub fn via(dst: Ipv4Network, gateway: Ipv4Addr, oif: u32) -> Self {
        Self {
            dst,
            gateway: Some(gateway),
            oif,
            table: RT_TABLE_MAIN,
            scope: RT_SCOPE_UNIVERSE,
            onlink: true,
        }
    }

    /// A scope-link route for `dst` on `oif` in the main table
    pub fn link(dst: Ipv4Network, oif: u32) -> Self {
        Self {
            dst,
            gateway: None,
            oif,
            table: RT_TABLE_MAIN,
            scope: RT_SCOPE_LINK,
            onlink: false,
        }
    }

    pub fn in_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    fn message(&self, kind: u16, flags: u16) -> MessageBuilder {
        let mut hdr = [0u8; RTMSG_LEN];
        hdr[0] = AF_INET;
        hdr[1] = self.dst.prefix();
        hdr[4] = if self.table < 256 { self.table as u8 } else { RT_TABLE_UNSPEC };
        hdr[5] = RTPROT_STATIC;
        hdr[6] = self.scope;
        hdr[7] = RTN_UNICAST;
        if self.onlink {
            NativeEndian::write_u32(&mut hdr[8..12], RTNH_F_ONLINK);
        }

        let mut msg = MessageBuilder::new(kind, flags);
        msg.append(&hdr);
        msg.attr_u32(RTA_TABLE, self.table);
        if self.dst.prefix() > 0 {
            msg.attr_ipv4(RTA_DST, self.dst.network());
        }
        if let Some(gateway) = self.gateway {
            msg.attr_ipv4(RTA_GATEWAY, gateway);
        }
        msg.attr_u32(RTA_OIF, self.oif);
        msg
    }
}

/// A policy routing rule sending traffic from `src` to `table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub src: Ipv4Network,
    pub iif: Option<String>,
    pub table: u32,
    pub priority: u32,
}

impl Rule {
    fn message(&self, kind: u16, flags: u16) -> MessageBuilder {
        let mut hdr = [0u8; FIB_RULE_HDR_LEN];
        hdr[0] = AF_INET;
        hdr[2] = self.src.prefix();
        hdr[4] = if self.table < 256 { self.table as u8 } else { RT_TABLE_UNSPEC };
        hdr[7] = FR_ACT_TO_TBL;

        let mut msg = MessageBuilder::new(kind, flags);
        msg.append(&hdr);
        if self.src.prefix() > 0 {
            msg.attr_ipv4(FRA_SRC, self.src.network());
        }
        if let Some(iif) = &self.iif {
            msg.attr_str(FRA_IIFNAME, iif);
        }
        msg.attr_u32(FRA_PRIORITY, self.priority);
        msg.attr_u32(FRA_TABLE, self.table);
        msg
    }
}

impl NetlinkSocket {
    pub fn add_route(&mut self, route: &Route) -> Result<(), NetlinkError> {
        self.request("add route", route.message(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL))
    }

    pub fn delete_route(&mut self, route: &Route) -> Result<(), NetlinkError> {
        self.request("delete route", route.message(RTM_DELROUTE, 0))
    }

    pub fn add_rule(&mut self, rule: &Rule) -> Result<(), NetlinkError> {
        self.request("add rule", rule.message(RTM_NEWRULE, NLM_F_CREATE | NLM_F_EXCL))
    }

    pub fn delete_rule(&mut self, rule: &Rule) -> Result<(), NetlinkError> {
        self.request("delete rule", rule.message(RTM_DELRULE, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::{read_ipv4, read_str, read_u32, Attributes};

    fn body(msg: MessageBuilder) -> Vec<u8> {
        msg.finish(1, 0).unwrap()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_route_message() {
        let dst: Ipv4Network = "10.1.0.0/16".parse().unwrap();
        let route = Route::via(dst, Ipv4Addr::new(1, 0, 0, 2), 9).in_table(120);
        let bytes = body(route.message(RTM_NEWROUTE, 0));

        assert_eq!(bytes[1], 16);
        assert_eq!(bytes[4], 120);
        assert_eq!(bytes[6], RT_SCOPE_UNIVERSE);
        assert_eq!(NativeEndian::read_u32(&bytes[8..12]), RTNH_F_ONLINK);

        let attrs: Vec<(u16, Vec<u8>)> = Attributes::new(&bytes[RTMSG_LEN..])
            .map(|(k, v)| (k, v.to_vec()))
            .collect();
        assert_eq!(attrs[0].0, RTA_TABLE);
        assert_eq!(read_u32(&attrs[0].1), Some(120));
        assert_eq!(read_ipv4(&attrs[1].1), Some(Ipv4Addr::new(10, 1, 0, 0)));
        assert_eq!(read_ipv4(&attrs[2].1), Some(Ipv4Addr::new(1, 0, 0, 2)));
        assert_eq!((attrs[3].0, read_u32(&attrs[3].1)), (RTA_OIF, Some(9)));
    }

    #[test]
    fn test_default_route_has_no_destination() {
        let route = Route::via("0.0.0.0/0".parse().unwrap(), Ipv4Addr::new(1, 0, 0, 1), 3);
        let bytes = body(route.message(RTM_NEWROUTE, 0));
        assert!(Attributes::new(&bytes[RTMSG_LEN..]).all(|(k, _)| k != RTA_DST));
    }

    #[test]
    fn test_large_table_ids_use_attribute_only() {
        let route = Route::link("10.0.0.1/32".parse().unwrap(), 3).in_table(1000);
        let bytes = body(route.message(RTM_NEWROUTE, 0));
        assert_eq!(bytes[4], RT_TABLE_UNSPEC);
        assert_eq!(bytes[6], RT_SCOPE_LINK);
    }

    #[test]
    fn test_rule_message() {
        let rule = Rule {
            src: "10.0.0.0/24".parse().unwrap(),
            iif: Some("self".into()),
            table: 120,
            priority: 100,
        };
        let bytes = body(rule.message(RTM_NEWRULE, 0));
        assert_eq!(bytes[2], 24);
        assert_eq!(bytes[4], 120);
        assert_eq!(bytes[7], FR_ACT_TO_TBL);
        let attrs: Vec<(u16, Vec<u8>)> = Attributes::new(&bytes[FIB_RULE_HDR_LEN..])
            .map(|(k, v)| (k, v.to_vec()))
            .collect();
        assert_eq!(attrs[0].0, FRA_SRC);
        assert_eq!(read_str(&attrs[1].1), "self");
        assert_eq!(read_u32(&attrs[2].1), Some(100));
        assert_eq!(read_u32(&attrs[3].1), Some(120));
    }

    #[test]
    fn test_delete_messages_match_their_additions() {
        let route = Route::link("10.0.0.1/32".parse().unwrap(), 3);
        let add = route.message(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL);
        let del = route.message(RTM_DELROUTE, 0);
        assert_eq!((del.kind(), del.flags()), (RTM_DELROUTE, 0));
        assert_eq!(body(add), body(del));

        let rule = Rule {
            src: "10.0.0.0/24".parse().unwrap(),
            iif: None,
            table: 120,
            priority: 100,
        };
        let add = rule.message(RTM_NEWRULE, NLM_F_CREATE | NLM_F_EXCL);
        let del = rule.message(RTM_DELRULE, 0);
        assert_eq!(del.kind(), RTM_DELRULE);
        let (add, del) = (body(add), body(del));
        assert_eq!(add, del);
        assert!(Attributes::new(&del[FIB_RULE_HDR_LEN..]).all(|(k, _)| k != FRA_IIFNAME));
    }
}
