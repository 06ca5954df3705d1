//! rtnetlink constants
//!
//! Message types, attribute types and neighbour states come from `libc`.
//! Flags that `libc` declares as `c_int` are narrowed to the width of the
//! header field they fill. The rest (`linux/fib_rules.h`, netem attributes,
//! veth peer info) are not exported by `libc` and are defined here.

pub use libc::{
    IFA_ADDRESS, IFA_ANYCAST, IFA_BROADCAST, IFA_LOCAL, IFLA_ADDRESS, IFLA_IFNAME, IFLA_INFO_DATA,
    IFLA_INFO_KIND, IFLA_LINKINFO, IFLA_MTU, IFLA_NET_NS_FD, NDA_DST, NDA_LLADDR, NUD_DELAY,
    NUD_NOARP, NUD_PERMANENT, NUD_PROBE, NUD_REACHABLE, NUD_STALE, RTA_DST, RTA_GATEWAY, RTA_OIF,
    RTA_TABLE, RTM_DELADDR, RTM_DELLINK, RTM_DELROUTE, RTM_DELRULE, RTM_GETADDR, RTM_GETLINK,
    RTM_GETNEIGH, RTM_NEWADDR, RTM_NEWLINK, RTM_NEWNEIGH, RTM_NEWQDISC, RTM_NEWROUTE, RTM_NEWRULE,
    RTN_UNICAST, RTPROT_STATIC, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_UNSPEC, TCA_KIND,
    TCA_OPTIONS,
};

pub const NLMSG_HDRLEN: usize = std::mem::size_of::<libc::nlmsghdr>();
pub const NLA_HDRLEN: usize = std::mem::size_of::<libc::nlattr>();

pub const NLMSG_NOOP: u16 = libc::NLMSG_NOOP as u16;
pub const NLMSG_ERROR: u16 = libc::NLMSG_ERROR as u16;
pub const NLMSG_DONE: u16 = libc::NLMSG_DONE as u16;

pub const NLM_F_REQUEST: u16 = libc::NLM_F_REQUEST as u16;
pub const NLM_F_MULTI: u16 = libc::NLM_F_MULTI as u16;
pub const NLM_F_ACK: u16 = libc::NLM_F_ACK as u16;
pub const NLM_F_DUMP: u16 = libc::NLM_F_DUMP as u16;
pub const NLM_F_REPLACE: u16 = libc::NLM_F_REPLACE as u16;
pub const NLM_F_EXCL: u16 = libc::NLM_F_EXCL as u16;
pub const NLM_F_CREATE: u16 = libc::NLM_F_CREATE as u16;

pub const AF_UNSPEC: u8 = libc::AF_UNSPEC as u8;
pub const AF_INET: u8 = libc::AF_INET as u8;

pub const RT_TABLE_MAIN: u32 = libc::RT_TABLE_MAIN as u32;

// linux/veth.h
pub const VETH_INFO_PEER: u16 = 1;

// linux/rtnetlink.h, nexthop flags
pub const RTNH_F_ONLINK: u32 = 4;

// linux/fib_rules.h
pub const FRA_SRC: u16 = 2;
pub const FRA_IIFNAME: u16 = 3;
pub const FRA_PRIORITY: u16 = 6;
pub const FRA_TABLE: u16 = 15;
pub const FR_ACT_TO_TBL: u8 = 1;

// linux/pkt_sched.h
pub const TCA_NETEM_RATE: u16 = 6;
pub const TCA_NETEM_RATE64: u16 = 13;
pub const TC_H_ROOT: u32 = 0xFFFF_FFFF;
