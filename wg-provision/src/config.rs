// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file and validating
//! its contents: names used in file paths and shell commands, address block
//! sizes and roster uniqueness.

use crate::allocator::MAX_IPV6_PREFIX_LEN;
use crate::keystore::SERVER_IDENTITY;
use crate::types::{Config, NetworkBlock};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Longest IPv4 prefix that still leaves room for the server and a client
const MAX_IPV4_PREFIX_LEN: u8 = 30;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
    parse_config(&contents)
}

/// Parse and validate configuration text
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates that a name is safe to use in file names and shell commands.
/// Only allows alphanumeric characters, hyphens, and underscores.
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.host.trim().is_empty() {
        anyhow::bail!("general.host cannot be empty");
    }

    if config.general.endpoint_host().trim().is_empty() {
        anyhow::bail!("general.endpoint cannot be empty");
    }

    validate_name(&config.general.interface, "Interface name")?;

    if config.general.listen_port == 0 {
        anyhow::bail!("listen_port must be > 0");
    }

    if config.network.ipv4.prefix_len() > MAX_IPV4_PREFIX_LEN {
        anyhow::bail!(
            "IPv4 block {} is too small: prefix must be /{} or shorter",
            config.network.ipv4,
            MAX_IPV4_PREFIX_LEN
        );
    }

    if let Some(ipv6) = &config.network.ipv6 {
        if ipv6.prefix_len() > MAX_IPV6_PREFIX_LEN {
            anyhow::bail!(
                "IPv6 prefix {} is too long: must be /{} or shorter",
                ipv6,
                MAX_IPV6_PREFIX_LEN
            );
        }
    }

    let mut seen = HashSet::new();
    for (ordinal, name) in config.roster.clients.entries() {
        validate_name(name, "Client name")
            .with_context(|| format!("Invalid roster entry at ordinal {}", ordinal))?;
        if name == SERVER_IDENTITY {
            anyhow::bail!("Client name '{}' is reserved for the server", name);
        }
        // Client documents share the output directory with `<interface>.conf`
        if name == config.general.interface {
            anyhow::bail!(
                "Client name '{}' collides with the interface name and would overwrite its config",
                name
            );
        }
        if !seen.insert(name) {
            anyhow::bail!("Client '{}' appears more than once in the roster", name);
        }
    }

    Ok(())
}

impl Config {
    /// Network block as configured (IPv6 may still be discovered later)
    pub fn network_block(&self) -> NetworkBlock {
        NetworkBlock {
            ipv4: self.network.ipv4,
            ipv6: self.network.ipv6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[general]
host = "vpn.example.org"

[roster]
clients = ["alice", "", "bob"]
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.general.host, "vpn.example.org");
        assert_eq!(config.general.interface, "wg0");
        assert_eq!(config.network.ipv4.to_string(), "10.66.0.0/24");
        assert!(config.network.ipv6.is_none());
        assert_eq!(config.roster.clients.len(), 3);
        assert_eq!(config.host.min_os_version, "6.8");
        assert_eq!(config.host.allow_snapshot_of.as_deref(), Some("6.7"));
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
[general]
host = "root@203.0.113.7"
endpoint = "vpn.example.org"
interface = "wg1"
listen_port = 4500
materials_dir = "/var/lib/wg/keys"
output_dir = "/var/lib/wg/out"
keygen = "wg-tool"
qr_codes = false
log_level = "debug"

[network]
ipv4 = "10.99.0.0/16"
ipv6 = "fd00:1::/64"

[roster]
clients = ["alice"]

[host]
min_os_version = "7.5"
"#,
        )
        .unwrap();
        assert_eq!(config.general.endpoint_host(), "vpn.example.org");
        assert_eq!(config.general.listen_port, 4500);
        assert_eq!(config.general.keygen, crate::types::KeygenKind::WgTool);
        assert!(!config.general.qr_codes);
        assert_eq!(config.network_block().ipv6.unwrap().to_string(), "fd00:1::/64");
        assert_eq!(config.host.min_os_version, "7.5");
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse_config(include_str!("../../wg-provision.example.toml")).unwrap();
        assert_eq!(config.general.host, "root@vpn.example.org");
        assert_eq!(config.roster.clients.slots()[1], None);
    }

    #[test]
    fn test_validate_config_rejects_bad_client_names() {
        let bad = MINIMAL.replace("\"bob\"", "\"bob; rm -rf /\"");
        assert!(parse_config(&bad).is_err());

        let bad = MINIMAL.replace("\"bob\"", "\"../bob\"");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_validate_config_rejects_duplicates() {
        let bad = MINIMAL.replace("\"bob\"", "\"alice\"");
        let err = parse_config(&bad).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_config_rejects_server_name() {
        let bad = MINIMAL.replace("\"bob\"", "\"server\"");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_validate_config_rejects_interface_name() {
        let bad = MINIMAL.replace("\"bob\"", "\"wg0\"");
        let err = parse_config(&bad).unwrap_err();
        assert!(err.to_string().contains("interface name"));

        let renamed = MINIMAL.replace(
            "host = \"vpn.example.org\"",
            "host = \"vpn.example.org\"\ninterface = \"bob\"",
        );
        assert!(parse_config(&renamed).is_err());
    }

    #[test]
    fn test_validate_config_rejects_small_blocks() {
        let bad = format!("{}\n[network]\nipv4 = \"10.66.0.0/31\"\n", MINIMAL);
        assert!(parse_config(&bad).is_err());

        let ok = format!("{}\n[network]\nipv4 = \"10.66.0.0/30\"\n", MINIMAL);
        assert!(parse_config(&ok).is_ok());

        let bad = format!(
            "{}\n[network]\nipv4 = \"10.66.0.0/24\"\nipv6 = \"fd00:1::/80\"\n",
            MINIMAL
        );
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_validate_config_rejects_zero_port() {
        let bad = MINIMAL.replace(
            "host = \"vpn.example.org\"",
            "host = \"vpn.example.org\"\nlisten_port = 0",
        );
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_validate_config_rejects_bad_interface() {
        let bad = MINIMAL.replace(
            "host = \"vpn.example.org\"",
            "host = \"vpn.example.org\"\ninterface = \"wg0 && reboot\"",
        );
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_validate_config_empty_roster_is_fine() {
        let config = parse_config("[general]\nhost = \"vpn\"\n").unwrap();
        assert!(config.roster.clients.is_empty());
    }

    #[test]
    fn test_validate_name_valid() {
        assert!(validate_name("wg0", "test").is_ok());
        assert!(validate_name("alice-phone", "test").is_ok());
        assert!(validate_name("bob_laptop2", "test").is_ok());
    }

    #[test]
    fn test_validate_name_invalid_special_chars() {
        assert!(validate_name("wg0; rm -rf /", "test").is_err());
        assert!(validate_name("$(malicious)", "test").is_err());
        assert!(validate_name("`whoami`", "test").is_err());
        assert!(validate_name("a/b", "test").is_err());
        assert!(validate_name("a b", "test").is_err());
        assert!(validate_name("", "test").is_err());
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let bad = format!("{}\n[network]\nipv4 = \"10.66.0.0\"\n", MINIMAL);
        assert!(parse_config(&bad).is_err());
    }
}
