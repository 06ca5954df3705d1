//! `NETLINK_ROUTE` socket with request/acknowledge handling

use super::consts::*;
use super::message::{MessageBuilder, Messages};
use super::NetlinkError;
use byteorder::{ByteOrder, NativeEndian};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket};
use nix::errno::Errno;
use std::io;
use tracing::{trace, warn};

const RECV_BUFFER: usize = 64 * 1024;

/// A route netlink socket bound to the namespace that was active on the
/// calling thread when it was opened.
pub struct NetlinkSocket {
    socket: Socket,
    port: u32,
    seq: u32,
    recv_buf: Vec<u8>,
}

impl std::fmt::Debug for NetlinkSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSocket")
            .field("port", &self.port)
            .field("seq", &self.seq)
            .finish()
    }
}

impl NetlinkSocket {
    pub fn open() -> Result<Self, NetlinkError> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(NetlinkError::Socket)?;
        let addr = socket.bind_auto().map_err(NetlinkError::Socket)?;
        trace!("Opened netlink socket with port {}", addr.port_number());
        Ok(Self {
            socket,
            port: addr.port_number(),
            seq: 0,
            recv_buf: Vec::with_capacity(RECV_BUFFER),
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn transmit(&mut self, msg: MessageBuilder) -> Result<u32, NetlinkError> {
        let seq = self.next_seq();
        let bytes = msg.finish(seq, self.port)?;
        loop {
            match self.socket.send(&bytes, 0) {
                Ok(_) => return Ok(seq),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetlinkError::Io(e)),
            }
        }
    }

    fn receive(&mut self) -> Result<(), NetlinkError> {
        loop {
            self.recv_buf.clear();
            self.recv_buf.reserve(RECV_BUFFER);
            match self.socket.recv(&mut self.recv_buf, 0) {
                Ok(_) => return Ok(()),
                Err(e) => match Errno::from_raw(e.raw_os_error().unwrap_or(0)) {
                    Errno::EINTR | Errno::EAGAIN => continue,
                    Errno::ENOBUFS => {
                        warn!("Netlink receive buffer overflowed; retrying read");
                        continue;
                    }
                    _ => return Err(NetlinkError::Io(e)),
                },
            }
        }
    }

    /// Send with `NLM_F_ACK` and wait for the kernel's verdict
    pub fn request(&mut self, op: &'static str, msg: MessageBuilder) -> Result<(), NetlinkError> {
        let mut msg = msg;
        msg.add_flags(NLM_F_REQUEST | NLM_F_ACK);
        let seq = self.transmit(msg)?;
        self.collect(op, seq, |_, _| Ok(()))
    }

    /// Send a dump request and feed every reply message to `on_msg`
    pub fn dump<F>(&mut self, op: &'static str, msg: MessageBuilder, on_msg: F) -> Result<(), NetlinkError>
    where
        F: FnMut(u16, &[u8]) -> Result<(), NetlinkError>,
    {
        let mut msg = msg;
        msg.add_flags(NLM_F_REQUEST | NLM_F_DUMP);
        let seq = self.transmit(msg)?;
        self.collect(op, seq, on_msg)
    }

    /// Read responses for `seq` until an acknowledgment, an error, the end of
    /// a multi-part reply, or a single data message arrives. Messages for
    /// other sequence numbers are stale replies and are dropped.
    fn collect<F>(&mut self, op: &'static str, seq: u32, mut on_msg: F) -> Result<(), NetlinkError>
    where
        F: FnMut(u16, &[u8]) -> Result<(), NetlinkError>,
    {
        loop {
            self.receive()?;
            let mut finished = false;
            for msg in Messages::new(&self.recv_buf) {
                let (header, payload) = msg?;
                if header.seq != seq {
                    trace!("Discarding stale netlink message (seq {} != {})", header.seq, seq);
                    continue;
                }
                match header.kind {
                    NLMSG_NOOP => {}
                    NLMSG_ERROR => {
                        let code = payload.get(..4).map(NativeEndian::read_i32).unwrap_or(0);
                        if code != 0 {
                            return Err(NetlinkError::Kernel {
                                op,
                                errno: Errno::from_raw(-code),
                            });
                        }
                        finished = true;
                    }
                    NLMSG_DONE => {
                        let code = payload.get(..4).map(NativeEndian::read_i32).unwrap_or(0);
                        if code < 0 {
                            return Err(NetlinkError::Kernel {
                                op,
                                errno: Errno::from_raw(-code),
                            });
                        }
                        finished = true;
                    }
                    kind => {
                        on_msg(kind, payload)?;
                        if header.flags & NLM_F_MULTI == 0 {
                            finished = true;
                        }
                    }
                }
            }
            if finished {
                return Ok(());
            }
        }
    }
}
