//! Netlink message construction and attribute parsing
//!
//! [`MessageBuilder`] is an append-only buffer holding one netlink message.
//! Family headers are appended raw; attributes are appended with their `rtattr`
//! header and padded to 4 bytes. Nested attributes are opened with
//! [`MessageBuilder::push_attr`] and closed with [`MessageBuilder::pop_attr`],
//! which backpatches the length of the attribute once its contents are known.

use super::consts::{NLA_HDRLEN, NLMSG_HDRLEN};
use super::NetlinkError;
use byteorder::{ByteOrder, NativeEndian};
use std::net::Ipv4Addr;

/// Maximum depth of nested attributes
pub const MAX_NESTING: usize = 10;

pub(crate) const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// One outgoing netlink message
#[derive(Debug)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    nest: [usize; MAX_NESTING],
    depth: usize,
}

impl MessageBuilder {
    pub fn new(kind: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        NativeEndian::write_u16(&mut buf[4..6], kind);
        NativeEndian::write_u16(&mut buf[6..8], flags);
        Self {
            buf,
            nest: [0; MAX_NESTING],
            depth: 0,
        }
    }

    pub fn kind(&self) -> u16 {
        NativeEndian::read_u16(&self.buf[4..6])
    }

    pub fn flags(&self) -> u16 {
        NativeEndian::read_u16(&self.buf[6..8])
    }

    pub fn add_flags(&mut self, flags: u16) {
        let merged = self.flags() | flags;
        NativeEndian::write_u16(&mut self.buf[6..8], merged);
    }

    /// Current message length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == NLMSG_HDRLEN
    }

    fn pad(&mut self) {
        let aligned = align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append raw bytes (a family header or fixed struct), padded to 4 bytes
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.pad();
    }

    pub fn attr(&mut self, kind: u16, payload: &[u8]) {
        let mut header = [0u8; NLA_HDRLEN];
        NativeEndian::write_u16(&mut header[0..2], (NLA_HDRLEN + payload.len()) as u16);
        NativeEndian::write_u16(&mut header[2..4], kind);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    pub fn attr_u32(&mut self, kind: u16, value: u32) {
        let mut bytes = [0u8; 4];
        NativeEndian::write_u32(&mut bytes, value);
        self.attr(kind, &bytes);
    }

    pub fn attr_u64(&mut self, kind: u16, value: u64) {
        let mut bytes = [0u8; 8];
        NativeEndian::write_u64(&mut bytes, value);
        self.attr(kind, &bytes);
    }

    /// Addresses are written in network byte order
    pub fn attr_ipv4(&mut self, kind: u16, addr: Ipv4Addr) {
        self.attr(kind, &addr.octets());
    }

    /// NUL-terminated string
    pub fn attr_str(&mut self, kind: u16, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.attr(kind, &bytes);
    }

    /// Open a nested attribute
    pub fn push_attr(&mut self, kind: u16) -> Result<(), NetlinkError> {
        if self.depth == MAX_NESTING {
            return Err(NetlinkError::TooDeep(MAX_NESTING));
        }
        self.nest[self.depth] = self.buf.len();
        self.depth += 1;
        let mut header = [0u8; NLA_HDRLEN];
        NativeEndian::write_u16(&mut header[2..4], kind);
        self.buf.extend_from_slice(&header);
        Ok(())
    }

    /// Close the innermost nested attribute
    pub fn pop_attr(&mut self) -> Result<(), NetlinkError> {
        if self.depth == 0 {
            return Err(NetlinkError::Malformed("attribute stack underflow".into()));
        }
        self.depth -= 1;
        let start = self.nest[self.depth];
        let len = self.buf.len() - start;
        NativeEndian::write_u16(&mut self.buf[start..start + 2], len as u16);
        self.pad();
        Ok(())
    }

    /// Seal the message with its sequence number and port id
    pub fn finish(mut self, seq: u32, port: u32) -> Result<Vec<u8>, NetlinkError> {
        if self.depth != 0 {
            return Err(NetlinkError::Malformed(format!(
                "{} nested attributes left open",
                self.depth
            )));
        }
        let len = self.buf.len() as u32;
        NativeEndian::write_u32(&mut self.buf[0..4], len);
        NativeEndian::write_u32(&mut self.buf[8..12], seq);
        NativeEndian::write_u32(&mut self.buf[12..16], port);
        Ok(self.buf)
    }
}

/// Header of a received netlink message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
}

/// Iterates the messages of one datagram as `(header, payload)`
pub struct Messages<'a> {
    buf: &'a [u8],
}

impl<'a> Messages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<(MessageHeader, &'a [u8]), NetlinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let header = MessageHeader {
            len: NativeEndian::read_u32(&self.buf[0..4]),
            kind: NativeEndian::read_u16(&self.buf[4..6]),
            flags: NativeEndian::read_u16(&self.buf[6..8]),
            seq: NativeEndian::read_u32(&self.buf[8..12]),
            port: NativeEndian::read_u32(&self.buf[12..16]),
        };
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(NetlinkError::Malformed(format!(
                "message length {} out of bounds",
                len
            ))));
        }
        let payload = &self.buf[NLMSG_HDRLEN..len];
        let next = align(len).min(self.buf.len());
        self.buf = &self.buf[next..];
        Some(Ok((header, payload)))
    }
}

/// Iterates `rtattr` records as `(kind, payload)`. Truncated trailing data is
/// ignored.
pub struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Attributes<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = NativeEndian::read_u16(&self.buf[0..2]) as usize;
        let kind = NativeEndian::read_u16(&self.buf[2..4]) & 0x3FFF;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let payload = &self.buf[NLA_HDRLEN..len];
        let next = align(len).min(self.buf.len());
        self.buf = &self.buf[next..];
        Some((kind, payload))
    }
}

pub(crate) fn read_ipv4(payload: &[u8]) -> Option<Ipv4Addr> {
    <[u8; 4]>::try_from(payload).ok().map(Ipv4Addr::from)
}

pub(crate) fn read_u32(payload: &[u8]) -> Option<u32> {
    (payload.len() >= 4).then(|| NativeEndian::read_u32(&payload[..4]))
}

pub(crate) fn read_str(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
