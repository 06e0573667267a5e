// Host fact discovery

//! Host capability and network discovery
//!
//! [`NetworkInspector`] answers the questions the orchestrator asks about the
//! target before changing anything: OS release, whether it runs a snapshot,
//! which interface carries the default route, and which IPv6 prefix (if any)
//! that interface holds.

use crate::error::ProvisionError;
use crate::host::{run_checked, LocalExecutor, RemoteExecutor};
use crate::types::HostConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

/// Marker in `kern.version` of snapshot kernels
const SNAPSHOT_MARKER: &str = "-current ";

/// Package mirror for snapshot hosts
const SNAPSHOT_PKG_MIRROR: &str = "https://ftp.openbsd.org/pub/OpenBSD/snapshots/packages";

/// Facts about the target host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Release, e.g. `7.5`
    pub os_version: String,
    /// Machine architecture, e.g. `amd64`
    pub arch: String,
    /// Full kernel version string
    pub kernel_version: String,
}

impl HostFacts {
    /// True for `-current` snapshot kernels
    pub fn is_snapshot(&self) -> bool {
        self.kernel_version.contains(SNAPSHOT_MARKER)
    }

    /// `PKG_PATH` override needed to install packages on a snapshot
    pub fn snapshot_pkg_path(&self) -> Option<String> {
        self.is_snapshot()
            .then(|| format!("{}/{}/", SNAPSHOT_PKG_MIRROR, self.arch))
    }
}

/// Parse `major.minor` release numbers
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|m| {
            let digits: String = m.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .unwrap_or(Some(0))?;
    Some((major, minor))
}

/// Fail unless the host runs a supported release
///
/// Supported means at least `min_os_version`, or exactly
/// `allow_snapshot_of` on a snapshot kernel.
pub fn check_precondition(facts: &HostFacts, host: &HostConfig) -> Result<(), ProvisionError> {
    let running = parse_version(&facts.os_version).ok_or_else(|| {
        ProvisionError::Precondition(format!(
            "cannot parse OS version '{}'",
            facts.os_version
        ))
    })?;
    let minimum = parse_version(&host.min_os_version).ok_or_else(|| {
        ProvisionError::Precondition(format!(
            "invalid min_os_version '{}'",
            host.min_os_version
        ))
    })?;

    if running >= minimum {
        return Ok(());
    }

    let snapshot_ok = host
        .allow_snapshot_of
        .as_deref()
        .and_then(parse_version)
        .is_some_and(|release| release == running && facts.is_snapshot());
    if snapshot_ok {
        return Ok(());
    }

    Err(ProvisionError::Precondition(format!(
        "OS release {} is too old (need {} or newer{})",
        facts.os_version,
        host.min_os_version,
        host.allow_snapshot_of
            .as_deref()
            .map(|r| format!(", or a {} snapshot", r))
            .unwrap_or_default()
    )))
}

/// Parse output of `uname -r; uname -m; sysctl -n kern.version`
pub fn parse_host_facts(output: &str) -> Result<HostFacts> {
    let mut lines = output.lines();
    let os_version = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .context("Missing OS release in host facts")?
        .to_string();
    let arch = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .context("Missing architecture in host facts")?
        .to_string();
    let kernel_version = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Ok(HostFacts {
        os_version,
        arch,
        kernel_version,
    })
}

/// Find the default route's interface in `route -n show -inet` or
/// `ip route show default` output
pub fn parse_default_interface(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.starts_with("default"))
        .and_then(|line| {
            // Linux: "default via 192.168.1.1 dev eth0 proto dhcp metric 100"
            if let Some(pos) = line.find(" dev ") {
                return line[pos + 5..].split_whitespace().next();
            }
            // BSD: last column is the interface
            line.split_whitespace().last()
        })
        .map(str::to_string)
}

/// True for addresses usable as a routed prefix
fn is_global_v6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        || (first & 0xffc0) == 0xfe80)
}

/// First global IPv6 prefix in `ifconfig <if> inet6` or `ip -6 addr show`
/// output
pub fn parse_ipv6_prefix(output: &str) -> Option<Ipv6Net> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "inet6")?;
        let addr_word = words.next()?;

        // Linux form: "inet6 2001:db8::5/64 scope global"
        let (addr, prefix_len) = match addr_word.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u8>().ok()?),
            None => {
                // BSD form: "inet6 2001:db8::5 prefixlen 64 autoconf"
                words.find(|w| *w == "prefixlen")?;
                (addr_word, words.next()?.parse::<u8>().ok()?)
            }
        };

        // Strip a zone index ("fe80::1%vio0")
        let addr = addr.split('%').next()?;
        let addr: Ipv6Addr = addr.parse().ok()?;
        if !is_global_v6(&addr) || line.contains("deprecated") {
            return None;
        }
        Ipv6Net::new(addr, prefix_len).ok().map(|net| net.trunc())
    })
}

/// Discovery of host facts and uplink addressing
#[async_trait]
pub trait NetworkInspector: Send + Sync {
    /// OS release, architecture and kernel version
    async fn host_facts(&self) -> Result<HostFacts>;

    /// Interface carrying the IPv4 default route
    async fn default_interface(&self) -> Result<String>;

    /// Global IPv6 prefix configured on `interface`, if any
    async fn ipv6_prefix(&self, interface: &str) -> Result<Option<Ipv6Net>>;
}

/// Inspector that asks the target through its executor
pub struct RemoteInspector<'a, R: ?Sized> {
    exec: &'a R,
}

impl<'a, R: RemoteExecutor + ?Sized> RemoteInspector<'a, R> {
    /// Inspect the host behind `exec`
    pub fn new(exec: &'a R) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl<R: RemoteExecutor + ?Sized> NetworkInspector for RemoteInspector<'_, R> {
    async fn host_facts(&self) -> Result<HostFacts> {
        let output = run_checked(self.exec, "uname -r; uname -m; sysctl -n kern.version")
            .await
            .context("Failed to query host facts")?;
        parse_host_facts(&output)
    }

    async fn default_interface(&self) -> Result<String> {
        let output = run_checked(
            self.exec,
            "route -n show -inet 2>/dev/null || ip route show default",
        )
        .await
        .context("Failed to query routing table")?;
        parse_default_interface(&output).with_context(|| {
            format!("No default route found on {}", self.exec.target())
        })
    }

    async fn ipv6_prefix(&self, interface: &str) -> Result<Option<Ipv6Net>> {
        crate::config::validate_name(interface, "Interface name")?;
        let output = run_checked(
            self.exec,
            &format!(
                "ifconfig {0} inet6 2>/dev/null || ip -6 addr show dev {0}",
                interface
            ),
        )
        .await
        .with_context(|| format!("Failed to query IPv6 addresses of {}", interface))?;
        Ok(parse_ipv6_prefix(&output))
    }
}

/// Inspector for the local machine; addresses come from `getifaddrs`
#[derive(Debug, Clone, Default)]
pub struct LocalInspector {
    exec: LocalExecutor,
}

#[async_trait]
impl NetworkInspector for LocalInspector {
    async fn host_facts(&self) -> Result<HostFacts> {
        RemoteInspector::new(&self.exec).host_facts().await
    }

    async fn default_interface(&self) -> Result<String> {
        RemoteInspector::new(&self.exec).default_interface().await
    }

    async fn ipv6_prefix(&self, interface: &str) -> Result<Option<Ipv6Net>> {
        let interfaces =
            if_addrs::get_if_addrs().context("Failed to get interface addresses")?;

        for iface in interfaces {
            if iface.name != interface {
                continue;
            }
            if let if_addrs::IfAddr::V6(v6) = iface.addr {
                if !is_global_v6(&v6.ip) {
                    continue;
                }
                let prefix_len = u128::from(v6.netmask).count_ones() as u8;
                if let Ok(net) = Ipv6Net::new(v6.ip, prefix_len) {
                    return Ok(Some(net.trunc()));
                }
            }
        }

        Ok(None)
    }
}
