//! Interface ioctls
//!
//! The socket is a raw packet socket created while the namespace is active, so
//! every request addresses interfaces of that namespace.

use netaddr::MacAddr;
use nix::errno::Errno;
use nix::libc;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use thiserror::Error;

const ETHTOOL_SGRO: u32 = 0x0000_002c;

#[derive(Error, Debug)]
pub enum IoctlError {
    #[error("Failed to open ioctl socket: {0}")]
    Socket(Errno),

    #[error("Interface name '{0}' is too long")]
    NameTooLong(String),

    #[error("{op} on {iface} failed: {errno}")]
    Request {
        op: &'static str,
        iface: String,
        errno: Errno,
    },
}

impl IoctlError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            IoctlError::Socket(errno) | IoctlError::Request { errno, .. } => Some(*errno),
            IoctlError::NameTooLong(_) => None,
        }
    }
}

mod sys {
    use nix::libc;

    nix::ioctl_read_bad!(get_flags, libc::SIOCGIFFLAGS, libc::ifreq);
    nix::ioctl_write_ptr_bad!(set_flags, libc::SIOCSIFFLAGS, libc::ifreq);
    nix::ioctl_read_bad!(get_index, libc::SIOCGIFINDEX, libc::ifreq);
    nix::ioctl_read_bad!(get_mtu, libc::SIOCGIFMTU, libc::ifreq);
    nix::ioctl_read_bad!(get_hwaddr, libc::SIOCGIFHWADDR, libc::ifreq);
    nix::ioctl_write_ptr_bad!(ethtool, libc::SIOCETHTOOL, libc::ifreq);
}

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

fn request(name: &str) -> Result<libc::ifreq, IoctlError> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IF_NAMESIZE {
        return Err(IoctlError::NameTooLong(name.to_string()));
    }
    // SAFETY: ifreq is plain old data; all-zero is a valid value
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in ifr.ifr_name.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }
    Ok(ifr)
}

/// A socket for interface ioctls in one namespace
#[derive(Debug)]
pub struct IoctlSocket {
    fd: OwnedFd,
}

impl IoctlSocket {
    pub fn open() -> Result<Self, IoctlError> {
        // SAFETY: plain socket(2) call; the descriptor is owned immediately
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(IoctlError::Socket(Errno::last()));
        }
        Ok(Self {
            // SAFETY: fd is a freshly created descriptor nobody else owns
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn fail<'a>(op: &'static str, iface: &'a str) -> impl FnOnce(Errno) -> IoctlError + 'a {
        move |errno| IoctlError::Request {
            op,
            iface: iface.to_string(),
            errno,
        }
    }

    pub fn index(&self, iface: &str) -> Result<u32, IoctlError> {
        let mut ifr = request(iface)?;
        unsafe { sys::get_index(self.fd.as_raw_fd(), &mut ifr) }.map_err(Self::fail("SIOCGIFINDEX", iface))?;
        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex } as u32)
    }

    pub fn mtu(&self, iface: &str) -> Result<u32, IoctlError> {
        let mut ifr = request(iface)?;
        unsafe { sys::get_mtu(self.fd.as_raw_fd(), &mut ifr) }.map_err(Self::fail("SIOCGIFMTU", iface))?;
        Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as u32)
    }

    pub fn hwaddr(&self, iface: &str) -> Result<MacAddr, IoctlError> {
        let mut ifr = request(iface)?;
        unsafe { sys::get_hwaddr(self.fd.as_raw_fd(), &mut ifr) }.map_err(Self::fail("SIOCGIFHWADDR", iface))?;
        let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
        let mut octets = [0u8; 6];
        for (o, d) in octets.iter_mut().zip(data.iter()) {
            *o = *d as u8;
        }
        Ok(MacAddr::new(octets))
    }

    pub fn set_up(&self, iface: &str, up: bool) -> Result<(), IoctlError> {
        let mut ifr = request(iface)?;
        unsafe { sys::get_flags(self.fd.as_raw_fd(), &mut ifr) }.map_err(Self::fail("SIOCGIFFLAGS", iface))?;
        let flags = unsafe { ifr.ifr_ifru.ifru_flags };
        let iff_up = libc::IFF_UP as libc::c_short;
        let wanted = if up { flags | iff_up } else { flags & !iff_up };
        if wanted == flags {
            return Ok(());
        }
        ifr.ifr_ifru.ifru_flags = wanted;
        unsafe { sys::set_flags(self.fd.as_raw_fd(), &ifr) }.map_err(Self::fail("SIOCSIFFLAGS", iface))?;
        Ok(())
    }

    /// Toggle generic receive offload
    pub fn set_gro(&self, iface: &str, enabled: bool) -> Result<(), IoctlError> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_SGRO,
            data: u32::from(enabled),
        };
        let mut ifr = request(iface)?;
        ifr.ifr_ifru.ifru_data = (&mut value as *mut EthtoolValue).cast::<libc::c_char>();
        unsafe { sys::ethtool(self.fd.as_raw_fd(), &ifr) }.map_err(Self::fail("SIOCETHTOOL", iface))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_name_bounds() {
        let ifr = request("eth0").unwrap();
        assert_eq!(ifr.ifr_name[0] as u8, b'e');
        assert_eq!(ifr.ifr_name[4], 0);
        assert!(request("fifteen-chars-x").is_ok());
        assert!(matches!(
            request("sixteen-chars-xx"),
            Err(IoctlError::NameTooLong(_))
        ));
    }

    #[cfg(feature = "sudo-tests")]
    #[test]
    fn test_loopback_queries() {
        let sock = IoctlSocket::open().unwrap();
        assert_eq!(sock.index("lo").unwrap(), 1);
        assert_eq!(sock.mtu("lo").unwrap(), 65536);
        assert!(sock.hwaddr("lo").unwrap().is_zero());
    }
}
