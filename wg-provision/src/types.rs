// Shared types for allocation, key management and rendering

//! Shared data structures
//!
//! This module defines the data model that flows through the provisioning
//! pipeline (roster, network block, identities, allocated clients) and the
//! TOML configuration structures.

use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Ordinal reserved for the server inside every network block
pub const SERVER_ORDINAL: u32 = 1;

/// Ordinal of the first roster slot
pub const FIRST_CLIENT_ORDINAL: u32 = 2;

/// Ordered client roster
///
/// Empty slots are kept as positional placeholders so that removing a client
/// never shifts the ordinals (and therefore the addresses) of later clients.
/// New clients must be appended at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct Roster {
    slots: Vec<Option<String>>,
}

impl Roster {
    /// Build a roster from explicit slots (`None` marks a removed client)
    pub fn new(slots: Vec<Option<String>>) -> Self {
        Self { slots }
    }

    /// Number of slots, empty ones included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the roster has no slots at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Raw slots in roster order
    pub fn slots(&self) -> &[Option<String>] {
        &self.slots
    }

    /// Highest ordinal consumed by this roster, empty slots included
    pub fn highest_ordinal(&self) -> Option<u32> {
        if self.slots.is_empty() {
            return None;
        }
        let len = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        Some(len.saturating_add(FIRST_CLIENT_ORDINAL - 1))
    }

    /// Non-empty entries with their ordinals, in roster order
    pub fn entries(&self) -> impl Iterator<Item = (u32, &str)> {
        (FIRST_CLIENT_ORDINAL..)
            .zip(self.slots.iter())
            .filter_map(|(ordinal, slot)| slot.as_deref().map(|name| (ordinal, name)))
    }
}

impl From<Vec<String>> for Roster {
    /// An empty string or `-` marks an empty slot (TOML has no null)
    fn from(raw: Vec<String>) -> Self {
        let slots = raw
            .into_iter()
            .map(|name| {
                let trimmed = name.trim();
                if trimmed.is_empty() || trimmed == "-" {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect();
        Self { slots }
    }
}

/// Address blocks of the overlay network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkBlock {
    pub ipv4: Ipv4Net,
    pub ipv6: Option<Ipv6Net>,
}

/// Key material of one network participant
///
/// Keys are kept as the opaque single-line text produced by the key
/// generator; nothing here parses or validates them.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub private_key: String,
    pub public_key: String,
    /// Only client identities carry a preshared key
    pub preshared_key: Option<String>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field(
                "preshared_key",
                &self.preshared_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Addresses derived from one ordinal
///
/// Addresses carry the prefix length of their block (`10.66.0.2/24`), which
/// is what an interface stanza needs; host routes are derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub ordinal: u32,
    pub ipv4: Ipv4Net,
    pub ipv6: Option<Ipv6Net>,
}

impl Allocation {
    /// Bare IPv4 address
    pub fn ipv4_addr(&self) -> Ipv4Addr {
        self.ipv4.addr()
    }

    /// Bare IPv6 address, if dual-stack
    pub fn ipv6_addr(&self) -> Option<Ipv6Addr> {
        self.ipv6.map(|net| net.addr())
    }

    /// Interface addresses at block prefix length
    pub fn interface_addresses(&self) -> Vec<String> {
        let mut out = vec![self.ipv4.to_string()];
        out.extend(self.ipv6.map(|net| net.to_string()));
        out
    }

    /// Single-address routes (`/32`, `/128`)
    pub fn host_routes(&self) -> Vec<String> {
        let mut out = vec![format!("{}/32", self.ipv4.addr())];
        out.extend(self.ipv6.map(|net| format!("{}/128", net.addr())));
        out
    }
}

/// A roster entry with its addresses and key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedClient {
    pub name: String,
    pub allocation: Allocation,
    pub identity: Identity,
}

impl AllocatedClient {
    /// Roster ordinal (>= 2)
    pub fn ordinal(&self) -> u32 {
        self.allocation.ordinal
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub roster: RosterConfig,
    #[serde(default)]
    pub host: HostConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// SSH target of the VPN server (`localhost` provisions this machine)
    pub host: String,
    /// Hostname clients dial; defaults to `host`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_materials_dir")]
    pub materials_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub keygen: KeygenKind,
    #[serde(default = "default_true")]
    pub qr_codes: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl GeneralConfig {
    /// Hostname placed in client `Endpoint` lines
    pub fn endpoint_host(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.host)
    }
}

/// Which key-generation primitive to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KeygenKind {
    /// In-process Curve25519 via wireguard-control
    #[default]
    Native,
    /// The `wg` command line tool
    WgTool,
}

/// Network block configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_ipv4_block")]
    pub ipv4: Ipv4Net,
    #[serde(default)]
    pub ipv6: Option<Ipv6Net>,
    /// Use the uplink's IPv6 prefix when `ipv6` is unset
    #[serde(default)]
    pub discover_ipv6: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ipv4: default_ipv4_block(),
            ipv6: None,
            discover_ipv6: false,
        }
    }
}

/// Roster configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RosterConfig {
    #[serde(default)]
    pub clients: Roster,
}

/// Target host requirements
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    #[serde(default = "default_min_os_version")]
    pub min_os_version: String,
    /// Release whose snapshot builds are also accepted
    #[serde(default = "default_allow_snapshot_of")]
    pub allow_snapshot_of: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            min_os_version: default_min_os_version(),
            allow_snapshot_of: default_allow_snapshot_of(),
        }
    }
}

// Default values for configuration
fn default_interface() -> String {
    "wg0".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_materials_dir() -> PathBuf {
    PathBuf::from("out/keys")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ipv4_block() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 66, 0, 0), 24).unwrap_or_default()
}

fn default_min_os_version() -> String {
    "6.8".to_string()
}

fn default_allow_snapshot_of() -> Option<String> {
    Some("6.7".to_string())
}
