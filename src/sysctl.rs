//! Kernel tunables under `/proc/sys`
//!
//! Entries below `net/` resolve against the network namespace of the calling
//! thread, so per-namespace settings are written right after switching.

use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub const PROC_SYS: &str = "/proc/sys";

const IP_FORWARD: &str = "net/ipv4/ip_forward";
const ACCEPT_LOCAL: [&str; 2] = ["net/ipv4/conf/all/accept_local", "net/ipv4/conf/default/accept_local"];
const RP_FILTER: [&str; 2] = ["net/ipv4/conf/all/rp_filter", "net/ipv4/conf/default/rp_filter"];
const DISABLE_IPV6: [&str; 2] = ["net/ipv6/conf/all/disable_ipv6", "net/ipv6/conf/default/disable_ipv6"];
const GC_THRESH: [&str; 3] = [
    "net/ipv4/neigh/default/gc_thresh1",
    "net/ipv4/neigh/default/gc_thresh2",
    "net/ipv4/neigh/default/gc_thresh3",
];

#[derive(Error, Debug)]
pub enum SysctlError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unexpected value '{value}' in {path}")]
    Parse { path: PathBuf, value: String },
}

/// ARP cache garbage collection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpThresholds {
    pub thresh1: u64,
    pub thresh2: u64,
    pub thresh3: u64,
}

impl ArpThresholds {
    /// Thresholds that keep `expected` neighbor entries below the soft limit,
    /// or `None` if the current values already do. Every threshold is raised
    /// by the same deficit so their spacing is preserved.
    pub fn raised_for(&self, expected: u64) -> Option<ArpThresholds> {
        if expected <= self.thresh2 {
            return None;
        }
        let deficit = expected - self.thresh2;
        Some(ArpThresholds {
            thresh1: self.thresh1.saturating_add(deficit),
            thresh2: self.thresh2.saturating_add(deficit),
            thresh3: self.thresh3.saturating_add(deficit),
        })
    }
}

/// A view of the sysctl tree
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new(PROC_SYS)
    }
}

impl Sysctl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn read(&self, key: &str) -> Result<String, SysctlError> {
        let path = self.path(key);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|source| SysctlError::Read { path, source })
    }

    pub fn read_u64(&self, key: &str) -> Result<u64, SysctlError> {
        let value = self.read(key)?;
        value.parse().map_err(|_| SysctlError::Parse {
            path: self.path(key),
            value,
        })
    }

    pub fn write(&self, key: &str, value: &str) -> Result<(), SysctlError> {
        let path = self.path(key);
        debug!("sysctl {} = {}", key, value);
        std::fs::write(&path, value.as_bytes()).map_err(|source| SysctlError::Write { path, source })
    }

    /// Write a key that only exists on some kernels
    fn write_if_present(&self, key: &str, value: &str) -> Result<(), SysctlError> {
        match self.write(key, value) {
            Err(SysctlError::Write { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    /// Prepare the active namespace to route emulated traffic: forwarding on,
    /// locally sourced packets accepted, reverse path filtering and IPv6 off.
    pub fn configure_router(&self) -> Result<(), SysctlError> {
        self.write(IP_FORWARD, "1")?;
        for key in ACCEPT_LOCAL {
            self.write(key, "1")?;
        }
        for key in RP_FILTER {
            self.write(key, "0")?;
        }
        for key in DISABLE_IPV6 {
            self.write_if_present(key, "1")?;
        }
        Ok(())
    }

    pub fn arp_thresholds(&self) -> Result<ArpThresholds, SysctlError> {
        Ok(ArpThresholds {
            thresh1: self.read_u64(GC_THRESH[0])?,
            thresh2: self.read_u64(GC_THRESH[1])?,
            thresh3: self.read_u64(GC_THRESH[2])?,
        })
    }

    pub fn set_arp_thresholds(&self, thresholds: &ArpThresholds) -> Result<(), SysctlError> {
        // Written from the top down so the kernel never sees thresh1 > thresh3
        self.write(GC_THRESH[2], &thresholds.thresh3.to_string())?;
        self.write(GC_THRESH[1], &thresholds.thresh2.to_string())?;
        self.write(GC_THRESH[0], &thresholds.thresh1.to_string())
    }

    /// Raise the ARP cache thresholds so that `expected` entries fit, warning
    /// the operator with the values to restore afterwards.
    pub fn ensure_arp_capacity(&self, expected: u64) -> Result<(), SysctlError> {
        let current = self.arp_thresholds()?;
        let Some(raised) = current.raised_for(expected) else {
            debug!("ARP cache thresholds {:?} fit {} entries", current, expected);
            return Ok(());
        };
        self.set_arp_thresholds(&raised)?;
        warn!(
            "Raised ARP cache thresholds to {}/{}/{} for {} entries. Restore them after the emulation with: \
             sysctl -w net.ipv4.neigh.default.gc_thresh1={} net.ipv4.neigh.default.gc_thresh2={} \
             net.ipv4.neigh.default.gc_thresh3={}",
            raised.thresh1,
            raised.thresh2,
            raised.thresh3,
            expected,
            current.thresh1,
            current.thresh2,
            current.thresh3
        );
        Ok(())
    }
}
