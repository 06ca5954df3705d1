use super::ConfigError;
use ipnetwork::Ipv4Network;
use netaddr::{parse_cidr, parse_ipv4, MacAddr};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An external machine reached through a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSpec {
    pub ip: Ipv4Addr,
    pub iface: Option<String>,
    /// Discovered through ARP when absent
    pub mac: Option<MacAddr>,
    /// Carved out of the global client subnet when absent
    pub vsubnet: Option<Ipv4Network>,
}

impl EdgeSpec {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            iface: None,
            mac: None,
            vsubnet: None,
        }
    }

    /// Apply one `key=value` property. Used for both the command line form
    /// and setup file groups.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "ip" => self.ip = parse_ipv4(value).map_err(|e| e.to_string())?,
            "iface" if value.is_empty() => return Err("empty interface name".into()),
            "iface" => self.iface = Some(value.to_string()),
            "mac" => self.mac = Some(value.parse::<MacAddr>().map_err(|e| e.to_string())?),
            "vsubnet" => self.vsubnet = Some(parse_cidr(value).map_err(|e| e.to_string())?),
            other => return Err(format!("unknown property '{}'", other)),
        }
        Ok(())
    }
}

impl FromStr for EdgeSpec {
    type Err = ConfigError;

    /// `ip[,iface=NAME][,mac=MAC][,vsubnet=CIDR]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidEdge {
            spec: s.to_string(),
            reason,
        };
        let mut parts = s.split(',');
        let ip = parts.next().unwrap_or_default();
        let mut edge = EdgeSpec::new(parse_ipv4(ip).map_err(|e| invalid(e.to_string()))?);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{}'", part)))?;
            if key.trim() == "ip" {
                return Err(invalid("the address must come first".into()));
            }
            edge.set(key.trim(), value.trim()).map_err(invalid)?;
        }
        Ok(edge)
    }
}

impl fmt::Display for EdgeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)?;
        if let Some(iface) = &self.iface {
            write!(f, ",iface={}", iface)?;
        }
        if let Some(mac) = &self.mac {
            write!(f, ",mac={}", mac)?;
        }
        if let Some(vsubnet) = &self.vsubnet {
            write!(f, ",vsubnet={}", vsubnet)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_edge() {
        let edge: EdgeSpec = "192.168.1.20,iface=eth1,mac=aa:bb:cc:dd:ee:0f,vsubnet=10.1.0.0/16"
            .parse()
            .unwrap();
        assert_eq!(edge.ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(edge.iface.as_deref(), Some("eth1"));
        assert_eq!(edge.mac, Some(MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f])));
        assert_eq!(edge.vsubnet, Some("10.1.0.0/16".parse().unwrap()));
        assert_eq!(
            edge.to_string(),
            "192.168.1.20,iface=eth1,mac=aa:bb:cc:dd:ee:0f,vsubnet=10.1.0.0/16"
        );
    }

    #[test]
    fn test_parse_bare_address() {
        let edge: EdgeSpec = "10.9.8.7".parse().unwrap();
        assert_eq!(edge, EdgeSpec::new(Ipv4Addr::new(10, 9, 8, 7)));
    }

    #[test]
    fn test_vsubnet_host_bits_cleared() {
        let edge: EdgeSpec = "1.2.3.4,vsubnet=10.1.2.3/16".parse().unwrap();
        assert_eq!(edge.vsubnet.unwrap().to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_rejects_bad_edges() {
        for bad in [
            "",
            "not-an-ip",
            "1.2.3.4,iface",
            "1.2.3.4,colour=blue",
            "1.2.3.4,mac=zz:00:00:00:00:00",
            "1.2.3.4,vsubnet=10.0.0.0/40",
            "1.2.3.4,ip=5.6.7.8",
            "1.2.3.4,iface=",
        ] {
            assert!(bad.parse::<EdgeSpec>().is_err(), "{:?} should fail", bad);
        }
    }
}
