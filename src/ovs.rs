//! Open vSwitch control plane
//!
//! Runs a private OVS instance whose database, sockets, pid files and logs all
//! live under one state directory. Commands run synchronously on the calling
//! thread and inherit its network namespace, so the daemons are started while
//! the root namespace is active.

use ipnetwork::Ipv4Network;
use netaddr::MacAddr;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SCHEMA: &str = "/usr/share/openvswitch/vswitch.ovsschema";

const DB_FILE: &str = "ovs.db";
const DB_SOCKET: &str = "ovsdb-server.sock";
const SERVER_PID: &str = "ovsdb-server.pid";
const SERVER_CTL: &str = "ovsdb-server.ctl";
const SERVER_LOG: &str = "ovsdb-server.log";
const SWITCH_PID: &str = "ovs-vswitchd.pid";
const SWITCH_CTL: &str = "ovs-vswitchd.ctl";
const SWITCH_LOG: &str = "ovs-vswitchd.log";

const BINARIES: [&str; 6] = [
    "ovsdb-tool",
    "ovsdb-server",
    "ovs-vsctl",
    "ovs-vswitchd",
    "ovs-ofctl",
    "ovs-appctl",
];

/// Versions after this one abort when their log file cannot be opened
const LOG_FILE_WORKAROUND_AFTER: (u32, u32) = (2, 4);

/// Flow priorities, highest first
pub mod priority {
    pub const ARP: u16 = 400;
    pub const SELF: u16 = 300;
    pub const IN: u16 = 200;
    pub const OUT: u16 = 100;
}

#[derive(Error, Debug)]
pub enum OvsError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Unrecognized version output from {program}: '{output}'")]
    Version { program: String, output: String },

    #[error("Open vSwitch binaries disagree on their version: {0}")]
    VersionMismatch(String),

    #[error("Failed to prepare OVS directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unexpected port number '{value}' for {iface}")]
    PortNumber { iface: String, value: String },
}

/// Parse `major.minor` from the first line of a `--version` banner
pub fn parse_version(output: &str) -> Option<(u32, u32)> {
    let token = output.lines().next()?.split_whitespace().last()?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Match-and-rewrite rule for IPv4 traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpFlow {
    pub priority: u16,
    pub in_port: Option<u32>,
    pub nw_src: Option<Ipv4Network>,
    pub nw_dst: Option<Ipv4Network>,
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub output: u32,
}

impl fmt::Display for IpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={},ip", self.priority)?;
        if let Some(port) = self.in_port {
            write!(f, ",in_port={}", port)?;
        }
        if let Some(src) = self.nw_src {
            write!(f, ",nw_src={}/{}", src.network(), src.prefix())?;
        }
        if let Some(dst) = self.nw_dst {
            write!(f, ",nw_dst={}/{}", dst.network(), dst.prefix())?;
        }
        write!(
            f,
            ",actions=mod_dl_src:{},mod_dl_dst:{},output:{}",
            self.dl_src, self.dl_dst, self.output
        )
    }
}

/// A rule turning ARP requests for `ip` into replies carrying `mac`, sent back
/// out of the port they arrived on
pub fn arp_response_flow(ip: Ipv4Addr, mac: MacAddr) -> String {
    format!(
        "priority={},dl_type=0x0806,nw_dst={},arp_op=1,actions=\
         move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],\
         mod_dl_src:{},\
         load:0x2->NXM_OF_ARP_OP[],\
         move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
         move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
         load:0x{:012x}->NXM_NX_ARP_SHA[],\
         load:0x{:08x}->NXM_OF_ARP_SPA[],\
         in_port",
        priority::ARP,
        ip,
        mac,
        mac.to_u64(),
        u32::from(ip)
    )
}

/// Make sure the openvswitch kernel module is loaded. A missing module is
/// only worth a warning: it may be built in.
pub fn ensure_module() {
    let loaded = std::fs::read_to_string("/proc/modules")
        .map(|modules| modules.lines().any(|l| l.split_whitespace().next() == Some("openvswitch")))
        .unwrap_or(false);
    if loaded {
        return;
    }
    match Command::new("modprobe").arg("openvswitch").stdin(Stdio::null()).output() {
        Ok(out) if out.status.success() => debug!("Loaded openvswitch kernel module"),
        Ok(out) => warn!(
            "Could not load the openvswitch kernel module: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => warn!("Could not run modprobe: {}", e),
    }
}

/// Driver for one private OVS instance
#[derive(Debug, Clone)]
pub struct Ovs {
    dir: PathBuf,
    version: Option<(u32, u32)>,
}

impl Ovs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            version: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn db_remote(&self) -> String {
        format!("unix:{}", self.file(DB_SOCKET).display())
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("OVS_RUNDIR", &self.dir)
            .env("OVS_DBDIR", &self.dir)
            .env("OVS_LOGDIR", &self.dir)
            .stdin(Stdio::null());
        cmd
    }

    fn needs_log_workaround(&self) -> bool {
        self.version.is_some_and(|v| v > LOG_FILE_WORKAROUND_AFTER)
    }

    fn check(program: &str, args: &[String], output: Output) -> Result<String, OvsError> {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines().chain(stderr.lines()).filter(|l| !l.trim().is_empty()) {
            debug!("{}: {}", program, line);
        }
        if !output.status.success() {
            return Err(OvsError::Failed {
                command: format!("{} {}", program, args.join(" ")),
                status: output.status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Run a command to completion, returning its standard output
    fn run(&self, program: &str, args: &[String]) -> Result<String, OvsError> {
        debug!("Running: {} {}", program, args.join(" "));
        let output = self
            .command(program)
            .args(args)
            .output()
            .map_err(|source| OvsError::Spawn {
                program: program.to_string(),
                source,
            })?;
        Self::check(program, args, output)
    }

    /// Start a daemon that detaches itself. Its output goes to its log file.
    fn spawn_daemon(&self, program: &str, args: &[String]) -> Result<(), OvsError> {
        debug!("Starting: {} {}", program, args.join(" "));
        let status = self
            .command(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| OvsError::Spawn {
                program: program.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(OvsError::Failed {
                command: format!("{} {}", program, args.join(" ")),
                status,
                stderr: format!("see {}", self.dir.display()),
            });
        }
        Ok(())
    }

    fn vsctl(&self, args: &[String]) -> Result<String, OvsError> {
        let mut full = vec![format!("--db={}", self.db_remote())];
        if self.needs_log_workaround() {
            full.push("--log-file=/dev/null".to_string());
        }
        full.extend_from_slice(args);
        self.run("ovs-vsctl", &full)
    }

    fn appctl(&self, target: &Path, args: &[&str]) -> Result<String, OvsError> {
        let mut full = Vec::new();
        if self.needs_log_workaround() {
            full.push("--log-file=/dev/null".to_string());
        }
        full.push("-t".to_string());
        full.push(target.display().to_string());
        full.extend(args.iter().map(|s| s.to_string()));
        self.run("ovs-appctl", &full)
    }

    fn ofctl(&self, args: &[String]) -> Result<String, OvsError> {
        self.run("ovs-ofctl", args)
    }

    /// Query every OVS binary's version and require them to agree
    pub fn detect_version(&mut self) -> Result<(u32, u32), OvsError> {
        let mut found: Option<(u32, u32)> = None;
        let mut seen = Vec::new();
        for program in BINARIES {
            let output = self.run(program, &["--version".to_string()])?;
            let version = parse_version(&output).ok_or_else(|| OvsError::Version {
                program: program.to_string(),
                output: output.trim().to_string(),
            })?;
            seen.push(format!("{} {}.{}", program, version.0, version.1));
            match found {
                Some(v) if v != version => return Err(OvsError::VersionMismatch(seen.join(", "))),
                _ => found = Some(version),
            }
        }
        let version = found.unwrap_or_default();
        info!("Using Open vSwitch {}.{}", version.0, version.1);
        self.version = Some(version);
        Ok(version)
    }

    /// Create a fresh database and start `ovsdb-server` and `ovs-vswitchd`
    pub fn start(&mut self, schema: &Path) -> Result<(), OvsError> {
        ensure_module();
        std::fs::create_dir_all(&self.dir).map_err(|source| OvsError::Directory {
            path: self.dir.clone(),
            source,
        })?;
        let db = self.file(DB_FILE);
        match std::fs::remove_file(&db) {
            Ok(()) => debug!("Removed stale database {}", db.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(OvsError::Directory { path: db, source }),
        }

        if self.version.is_none() {
            self.detect_version()?;
        }

        self.run(
            "ovsdb-tool",
            &[
                "create".to_string(),
                db.display().to_string(),
                schema.display().to_string(),
            ],
        )?;

        self.spawn_daemon(
            "ovsdb-server",
            &[
                db.display().to_string(),
                format!("--remote=punix:{}", self.file(DB_SOCKET).display()),
                format!("--pidfile={}", self.file(SERVER_PID).display()),
                format!("--unixctl={}", self.file(SERVER_CTL).display()),
                format!("--log-file={}", self.file(SERVER_LOG).display()),
                "--detach".to_string(),
                "--monitor".to_string(),
            ],
        )?;

        self.vsctl(&["--no-wait".to_string(), "init".to_string()])?;

        self.spawn_daemon(
            "ovs-vswitchd",
            &[
                self.db_remote(),
                "--mlockall".to_string(),
                format!("--pidfile={}", self.file(SWITCH_PID).display()),
                format!("--unixctl={}", self.file(SWITCH_CTL).display()),
                format!("--log-file={}", self.file(SWITCH_LOG).display()),
                "--detach".to_string(),
                "--monitor".to_string(),
            ],
        )?;
        info!("Started Open vSwitch in {}", self.dir.display());
        Ok(())
    }

    /// Ask both daemons to exit. Daemons that are not running are skipped.
    pub fn stop(&self) -> Result<(), OvsError> {
        for ctl in [SWITCH_CTL, SERVER_CTL] {
            let path = self.file(ctl);
            if !path.exists() {
                debug!("No control socket at {}", path.display());
                continue;
            }
            self.appctl(&path, &["exit"])?;
        }
        Ok(())
    }

    /// Create a bridge that drops everything until flows are added
    pub fn add_bridge(&self, name: &str, mtu: Option<u32>) -> Result<(), OvsError> {
        let mut args: Vec<String> = ["add-br", name, "--", "set-fail-mode", name, "secure"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(mtu) = mtu {
            args.extend(["--", "set", "Interface", name].iter().map(|s| s.to_string()));
            args.push(format!("mtu_request={}", mtu));
        }
        self.vsctl(&args)?;
        self.clear_flows(name)
    }

    /// Attach `iface` to `bridge` and return its OpenFlow port number
    pub fn add_port(&self, bridge: &str, iface: &str) -> Result<u32, OvsError> {
        self.vsctl(&["add-port".to_string(), bridge.to_string(), iface.to_string()])?;
        let value = self.vsctl(&[
            "get".to_string(),
            "Interface".to_string(),
            iface.to_string(),
            "ofport".to_string(),
        ])?;
        let value = value.trim();
        value
            .parse::<i64>()
            .ok()
            .filter(|port| *port > 0)
            .map(|port| port as u32)
            .ok_or_else(|| OvsError::PortNumber {
                iface: iface.to_string(),
                value: value.to_string(),
            })
    }

    pub fn clear_flows(&self, bridge: &str) -> Result<(), OvsError> {
        self.ofctl(&["del-flows".to_string(), bridge.to_string()])?;
        Ok(())
    }

    pub fn add_flow(&self, bridge: &str, flow: &str) -> Result<(), OvsError> {
        self.ofctl(&["add-flow".to_string(), bridge.to_string(), flow.to_string()])?;
        Ok(())
    }

    pub fn add_ip_flow(&self, bridge: &str, flow: &IpFlow) -> Result<(), OvsError> {
        self.add_flow(bridge, &flow.to_string())
    }

    pub fn add_arp_responder(&self, bridge: &str, ip: Ipv4Addr, mac: MacAddr) -> Result<(), OvsError> {
        self.add_flow(bridge, &arp_response_flow(ip, mac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("ovs-vsctl (Open vSwitch) 2.17.9\nDB Schema 8.3.0\n"), Some((2, 17)));
        assert_eq!(parse_version("ovsdb-tool (Open vSwitch) 2.3.1"), Some((2, 3)));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("ovs-vsctl (Open vSwitch) unknown"), None);
    }

    #[test]
    fn test_log_workaround_threshold() {
        let mut ovs = Ovs::new("/tmp/netmirage");
        assert!(!ovs.needs_log_workaround());
        ovs.version = Some((2, 4));
        assert!(!ovs.needs_log_workaround());
        ovs.version = Some((2, 5));
        assert!(ovs.needs_log_workaround());
        ovs.version = Some((3, 0));
        assert!(ovs.needs_log_workaround());
    }

    #[test]
    fn test_ip_flow_format() {
        let flow = IpFlow {
            priority: priority::IN,
            in_port: Some(1),
            nw_src: Some("10.0.0.0/24".parse().unwrap()),
            nw_dst: None,
            dl_src: MacAddr::new([2, 0, 0, 0, 0, 3]),
            dl_dst: MacAddr::new([2, 0, 0, 0, 0, 4]),
            output: 7,
        };
        assert_eq!(
            flow.to_string(),
            "priority=200,ip,in_port=1,nw_src=10.0.0.0/24,\
             actions=mod_dl_src:02:00:00:00:00:03,mod_dl_dst:02:00:00:00:00:04,output:7"
        );
    }

    #[test]
    fn test_arp_response_flow() {
        let flow = arp_response_flow(Ipv4Addr::new(192, 168, 1, 10), MacAddr::new([0xaa, 0xbb, 0xcc, 0, 1, 2]));
        assert!(flow.starts_with("priority=400,dl_type=0x0806,nw_dst=192.168.1.10,arp_op=1,actions="));
        assert!(flow.contains("mod_dl_src:aa:bb:cc:00:01:02"));
        assert!(flow.contains("load:0xaabbcc000102->NXM_NX_ARP_SHA[]"));
        assert!(flow.contains("load:0xc0a8010a->NXM_OF_ARP_SPA[]"));
        assert!(flow.ends_with(",in_port"));
    }
}
