//! netem root qdisc encoding
//!
//! Delay and jitter are expressed in packet scheduler ticks whose rate is read
//! from `/proc/net/psched`, following the iproute2 conversion.

use super::consts::*;
use super::message::MessageBuilder;
use super::{NetlinkError, NetlinkSocket};
use byteorder::{ByteOrder, NativeEndian};
use std::path::Path;
use tracing::debug;

const TCMSG_LEN: usize = 20;
const NETEM_QOPT_LEN: usize = 24;
const NETEM_RATE_LEN: usize = 16;

/// Queue length used when none is requested
pub const DEFAULT_LIMIT: u32 = 1000;

/// Root qdisc handle `1:0`
const ROOT_HANDLE: u32 = 0x0001_0000;

/// Packet scheduler clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PschedClock {
    pub ticks_per_ms: f64,
}

impl PschedClock {
    pub fn from_ticks_per_ms(ticks_per_ms: f64) -> Self {
        Self { ticks_per_ms }
    }

    /// Parse the contents of `/proc/net/psched`
    pub fn parse(contents: &str) -> Result<Self, NetlinkError> {
        let words: Vec<u32> = contents
            .split_whitespace()
            .take(3)
            .map(|w| u32::from_str_radix(w, 16))
            .collect::<Result<_, _>>()
            .map_err(|e| NetlinkError::Psched(format!("bad psched value: {}", e)))?;
        let [mut t2us, us2t, clock_res] = <[u32; 3]>::try_from(words)
            .map_err(|_| NetlinkError::Psched("expected at least three values".into()))?;
        if us2t == 0 {
            return Err(NetlinkError::Psched("zero tick divisor".into()));
        }
        // Nanosecond clocks advertise a multiplier of 1000 that really is 1
        if clock_res == 1_000_000_000 {
            t2us = us2t;
        }
        let clock_factor = f64::from(clock_res) / 1_000_000.0;
        let tick_in_usec = f64::from(t2us) / f64::from(us2t) * clock_factor;
        Ok(Self {
            ticks_per_ms: tick_in_usec * 1000.0,
        })
    }

    pub fn read(path: &Path) -> Result<Self, NetlinkError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NetlinkError::Psched(format!("{}: {}", path.display(), e)))?;
        let clock = Self::parse(&contents)?;
        debug!("Packet scheduler runs at {} ticks/ms", clock.ticks_per_ms);
        Ok(clock)
    }

    pub fn ticks(&self, ms: f64) -> u32 {
        (ms * self.ticks_per_ms).floor().clamp(0.0, f64::from(u32::MAX)) as u32
    }
}

/// netem shaping for one direction of an interface
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetemParams {
    /// Milliseconds
    pub delay_ms: f64,
    /// Milliseconds
    pub jitter_ms: f64,
    /// Fraction in `[0, 1]`
    pub loss: f64,
    /// Mbit/s, 0 for unlimited
    pub rate_mbit: f64,
    /// Packets, 0 for [`DEFAULT_LIMIT`]
    pub queue_len: u32,
}

impl NetemParams {
    /// True when installing the qdisc would not change the interface
    pub fn is_noop(&self) -> bool {
        self.delay_ms <= 0.0
            && self.jitter_ms <= 0.0
            && self.loss <= 0.0
            && self.rate_mbit <= 0.0
            && self.queue_len == 0
    }

    fn loss_scaled(&self) -> u32 {
        let scaled = (self.loss.clamp(0.0, 1.0) * 4_294_967_296.0).floor();
        if scaled >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            scaled as u32
        }
    }

    fn rate_bytes(&self) -> u64 {
        (self.rate_mbit.max(0.0) * 1_000_000.0 / 8.0).round() as u64
    }

    /// `struct tc_netem_qopt`
    fn qopt(&self, clock: &PschedClock) -> [u8; NETEM_QOPT_LEN] {
        let limit = if self.queue_len == 0 { DEFAULT_LIMIT } else { self.queue_len };
        let fields = [
            clock.ticks(self.delay_ms),
            limit,
            self.loss_scaled(),
            0,
            0,
            clock.ticks(self.jitter_ms),
        ];
        let mut out = [0u8; NETEM_QOPT_LEN];
        NativeEndian::write_u32_into(&fields, &mut out);
        out
    }

    fn encode(&self, msg: &mut MessageBuilder, clock: &PschedClock) -> Result<(), NetlinkError> {
        msg.attr_str(TCA_KIND, "netem");
        msg.push_attr(TCA_OPTIONS)?;
        msg.append(&self.qopt(clock));

        let rate = self.rate_bytes();
        if rate > 0 {
            let mut tc_rate = [0u8; NETEM_RATE_LEN];
            NativeEndian::write_u32(&mut tc_rate[0..4], rate.min(u64::from(u32::MAX)) as u32);
            msg.attr(TCA_NETEM_RATE, &tc_rate);
            if rate >= u64::from(u32::MAX) {
                msg.attr_u64(TCA_NETEM_RATE64, rate);
            }
        }
        msg.pop_attr()
    }
}

fn tcmsg(index: u32) -> [u8; TCMSG_LEN] {
    let mut hdr = [0u8; TCMSG_LEN];
    hdr[0] = AF_UNSPEC;
    NativeEndian::write_u32(&mut hdr[4..8], index);
    NativeEndian::write_u32(&mut hdr[8..12], ROOT_HANDLE);
    NativeEndian::write_u32(&mut hdr[12..16], TC_H_ROOT);
    hdr
}

fn netem_message(index: u32, params: &NetemParams, clock: &PschedClock) -> Result<MessageBuilder, NetlinkError> {
    let mut msg = MessageBuilder::new(RTM_NEWQDISC, NLM_F_CREATE | NLM_F_REPLACE);
    msg.append(&tcmsg(index));
    params.encode(&mut msg, clock)?;
    Ok(msg)
}

impl NetlinkSocket {
    /// Install or replace the root netem qdisc of interface `index`
    pub fn set_netem(&mut self, index: u32, params: &NetemParams, clock: &PschedClock) -> Result<(), NetlinkError> {
        debug!("Applying netem to interface {}: {:?}", index, params);
        let msg = netem_message(index, params, clock)?;
        self.request("set qdisc", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::Attributes;

    #[test]
    fn test_psched_parse() {
        // Typical high resolution kernel
        let clock = PschedClock::parse("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(clock.ticks_per_ms, 15625.0);
        assert_eq!(clock.ticks(100.0), 1_562_500);

        let ns = PschedClock::parse("000003e8 00000001 3b9aca00 3b9aca00").unwrap();
        assert_eq!(ns.ticks_per_ms, 1_000_000.0);

        assert!(PschedClock::parse("000003e8").is_err());
        assert!(PschedClock::parse("zz 1 1").is_err());
    }

    #[test]
    fn test_netem_encoding() {
        let clock = PschedClock::from_ticks_per_ms(1.0);
        let params = NetemParams {
            delay_ms: 100.0,
            jitter_ms: 20.0,
            loss: 0.5,
            rate_mbit: 10.0,
            queue_len: 0,
        };
        let bytes = netem_message(4, &params, &clock)
            .unwrap()
            .finish(1, 0)
            .unwrap();
        assert_eq!(NativeEndian::read_u32(&bytes[0..4]) as usize, bytes.len());

        let tc = &bytes[NLMSG_HDRLEN..];
        assert_eq!(NativeEndian::read_u32(&tc[4..8]), 4);
        assert_eq!(NativeEndian::read_u32(&tc[12..16]), TC_H_ROOT);

        let attrs: Vec<(u16, &[u8])> = Attributes::new(&tc[TCMSG_LEN..]).collect();
        assert_eq!(attrs[0], (TCA_KIND, &b"netem\0"[..]));
        assert_eq!(attrs[1].0, TCA_OPTIONS);

        let options = attrs[1].1;
        let mut qopt = [0u32; 6];
        NativeEndian::read_u32_into(&options[..NETEM_QOPT_LEN], &mut qopt);
        assert_eq!(qopt[0], 100, "latency");
        assert_eq!(qopt[1], DEFAULT_LIMIT);
        assert_eq!(qopt[2], 2_147_483_648, "loss");
        assert_eq!(qopt[5], 20, "jitter");

        let nested: Vec<(u16, &[u8])> = Attributes::new(&options[NETEM_QOPT_LEN..]).collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].0, TCA_NETEM_RATE);
        assert_eq!(NativeEndian::read_u32(&nested[0].1[0..4]), 1_250_000);
    }

    #[test]
    fn test_loss_saturates() {
        let full = NetemParams {
            loss: 1.0,
            ..Default::default()
        };
        assert_eq!(full.loss_scaled(), u32::MAX);
        assert!(!full.is_noop());
        assert!(NetemParams::default().is_noop());
    }

    #[test]
    fn test_rate64_for_fast_links() {
        let clock = PschedClock::from_ticks_per_ms(1.0);
        let params = NetemParams {
            rate_mbit: 100_000.0,
            ..Default::default()
        };
        let bytes = netem_message(1, &params, &clock).unwrap().finish(1, 0).unwrap();
        let tc = &bytes[NLMSG_HDRLEN..];
        let options = Attributes::new(&tc[TCMSG_LEN..]).nth(1).unwrap().1;
        let nested: Vec<(u16, &[u8])> = Attributes::new(&options[NETEM_QOPT_LEN..]).collect();
        assert_eq!(nested[0].0, TCA_NETEM_RATE);
        assert_eq!(NativeEndian::read_u32(&nested[0].1[0..4]), u32::MAX);
        assert_eq!(nested[1].0, TCA_NETEM_RATE64);
        assert_eq!(NativeEndian::read_u64(nested[1].1), 12_500_000_000);
    }
}
