// WireGuard configuration rendering

//! Config document rendering
//!
//! Pure text assembly of the server interface description, the per-client
//! configs and the OpenBSD interface bring-up script. Field order is fixed
//! and peers keep roster order, so identical inputs always produce
//! byte-identical documents.

use crate::error::ProvisionError;
use crate::types::{AllocatedClient, Allocation, Identity};
use std::fmt::{self, Write as _};
use std::net::Ipv6Addr;

/// Default route pushed to every client
const IPV4_DEFAULT_ROUTE: &str = "0.0.0.0/0";
const IPV6_DEFAULT_ROUTE: &str = "::/0";

/// Server address clients dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from a hostname or address literal
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 literals need brackets to separate the port
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The server's `wg setconf` document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfigDocument {
    text: String,
    peers: usize,
}

impl ServerConfigDocument {
    /// Document text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of peer stanzas
    pub fn peer_count(&self) -> usize {
        self.peers
    }
}

impl fmt::Display for ServerConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A client's self-contained config (`wg-quick` format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfigDocument {
    name: String,
    text: String,
}

impl ClientConfigDocument {
    /// Client the document belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document text
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for ClientConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Incremental builder for the server document
///
/// The interface stanza only carries the listen port: the server's private
/// key is applied to the running interface from its own file by the
/// bring-up script.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    text: String,
    peers: usize,
}

impl ServerConfigBuilder {
    /// Start a document with the interface stanza
    pub fn new(listen_port: u16) -> Self {
        let mut text = String::new();
        let _ = writeln!(text, "[Interface]");
        let _ = writeln!(text, "ListenPort = {}", listen_port);
        Self { text, peers: 0 }
    }

    /// Append one peer stanza with host-route allowed addresses
    pub fn peer(mut self, client: &AllocatedClient) -> Result<Self, ProvisionError> {
        let psk = preshared_key(client, "server config")?;
        let _ = writeln!(self.text);
        let _ = writeln!(self.text, "[Peer]");
        let _ = writeln!(self.text, "PublicKey = {}", client.identity.public_key);
        let _ = writeln!(self.text, "PresharedKey = {}", psk);
        let _ = writeln!(
            self.text,
            "AllowedIPs = {}",
            client.allocation.host_routes().join(", ")
        );
        self.peers += 1;
        Ok(self)
    }

    /// Finish the document
    pub fn build(self) -> ServerConfigDocument {
        ServerConfigDocument {
            text: self.text,
            peers: self.peers,
        }
    }
}

/// Render the server document: one interface stanza, one peer per client
pub fn render_server_config(
    listen_port: u16,
    server_identity: &Identity,
    clients: &[AllocatedClient],
) -> Result<ServerConfigDocument, ProvisionError> {
    if server_identity.public_key.is_empty() {
        return Err(ProvisionError::Render {
            document: "server config".to_string(),
            reason: "server identity has no public key".to_string(),
        });
    }

    clients
        .iter()
        .try_fold(ServerConfigBuilder::new(listen_port), |builder, client| {
            if client.identity.public_key == server_identity.public_key {
                return Err(ProvisionError::Render {
                    document: "server config".to_string(),
                    reason: format!("client {} carries the server's key", client.name),
                });
            }
            builder.peer(client)
        })
        .map(ServerConfigBuilder::build)
}

/// Render one client's document naming the server as its only peer
pub fn render_client_config(
    client: &AllocatedClient,
    server_public_key: &str,
    endpoint: &Endpoint,
) -> Result<ClientConfigDocument, ProvisionError> {
    let document = format!("client config for {}", client.name);
    if server_public_key.is_empty() {
        return Err(ProvisionError::Render {
            document,
            reason: "server public key is empty".to_string(),
        });
    }
    let psk = preshared_key(client, &document)?;

    let mut allowed = vec![IPV4_DEFAULT_ROUTE];
    if client.allocation.ipv6.is_some() {
        allowed.push(IPV6_DEFAULT_ROUTE);
    }

    let mut text = String::new();
    let _ = writeln!(text, "[Interface]");
    let _ = writeln!(text, "PrivateKey = {}", client.identity.private_key);
    let _ = writeln!(
        text,
        "Address = {}",
        client.allocation.interface_addresses().join(", ")
    );
    let _ = writeln!(text);
    let _ = writeln!(text, "[Peer]");
    let _ = writeln!(text, "PublicKey = {}", server_public_key);
    let _ = writeln!(text, "PresharedKey = {}", psk);
    let _ = writeln!(text, "AllowedIPs = {}", allowed.join(", "));
    let _ = writeln!(text, "Endpoint = {}", endpoint);

    Ok(ClientConfigDocument {
        name: client.name.clone(),
        text,
    })
}

/// Render the `hostname.<if>` script that brings the server interface up
///
/// The script assigns the server addresses (ordinal 1), loads the peer
/// document and applies the private key from its own file.
pub fn render_interface_script(
    interface: &str,
    server: &Allocation,
    config_path: &str,
    private_key_path: &str,
) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "inet {} {} NONE description \"wireguard\"",
        server.ipv4.addr(),
        server.ipv4.netmask()
    );
    if let Some(v6) = server.ipv6 {
        let _ = writeln!(text, "inet6 {} {}", v6.addr(), v6.prefix_len());
    }
    let _ = writeln!(text, "up");
    let _ = writeln!(text);
    let _ = writeln!(text, "!/usr/local/bin/wg setconf {} {}", interface, config_path);
    let _ = writeln!(
        text,
        "!/usr/local/bin/wg set {} private-key {}",
        interface, private_key_path
    );
    text
}

fn preshared_key<'a>(
    client: &'a AllocatedClient,
    document: &str,
) -> Result<&'a str, ProvisionError> {
    client
        .identity
        .preshared_key
        .as_deref()
        .ok_or_else(|| ProvisionError::Render {
            document: document.to_string(),
            reason: format!("client {} has no preshared key", client.name),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str, ordinal: u32, v4: &str, v6: Option<&str>) -> AllocatedClient {
        AllocatedClient {
            name: name.to_string(),
            allocation: Allocation {
                ordinal,
                ipv4: v4.parse().unwrap(),
                ipv6: v6.map(|s| s.parse().unwrap()),
            },
            identity: Identity {
                private_key: format!("{}-private", name),
                public_key: format!("{}-public", name),
                preshared_key: Some(format!("{}-psk", name)),
            },
        }
    }

    fn server_identity() -> Identity {
        Identity {
            private_key: "server-private".to_string(),
            public_key: "server-public".to_string(),
            preshared_key: None,
        }
    }

    #[test]
    fn test_server_config_text() {
        let clients = vec![
            client("alice", 2, "10.66.0.2/24", None),
            client("bob", 4, "10.66.0.4/24", None),
        ];
        let doc = render_server_config(51820, &server_identity(), &clients).unwrap();
        assert_eq!(
            doc.as_str(),
            "[Interface]\n\
             ListenPort = 51820\n\
             \n\
             [Peer]\n\
             PublicKey = alice-public\n\
             PresharedKey = alice-psk\n\
             AllowedIPs = 10.66.0.2/32\n\
             \n\
             [Peer]\n\
             PublicKey = bob-public\n\
             PresharedKey = bob-psk\n\
             AllowedIPs = 10.66.0.4/32\n"
        );
        assert_eq!(doc.peer_count(), 2);
        assert!(!doc.as_str().contains("server-private"));
    }

    #[test]
    fn test_server_config_dual_stack_host_routes() {
        let clients = vec![client(
            "alice",
            2,
            "10.66.0.2/24",
            Some("fd00:1::7767:0:0:2/64"),
        )];
        let doc = render_server_config(51820, &server_identity(), &clients).unwrap();
        assert!(doc
            .as_str()
            .contains("AllowedIPs = 10.66.0.2/32, fd00:1::7767:0:0:2/128\n"));
    }

    #[test]
    fn test_server_config_without_clients() {
        let doc = render_server_config(51820, &server_identity(), &[]).unwrap();
        assert_eq!(doc.as_str(), "[Interface]\nListenPort = 51820\n");
        assert_eq!(doc.peer_count(), 0);
    }

    #[test]
    fn test_server_config_missing_psk() {
        let mut alice = client("alice", 2, "10.66.0.2/24", None);
        alice.identity.preshared_key = None;
        let err = render_server_config(51820, &server_identity(), &[alice]).unwrap_err();
        assert!(matches!(err, ProvisionError::Render { .. }));
    }

    #[test]
    fn test_server_config_rejects_server_key_on_client() {
        let mut alice = client("alice", 2, "10.66.0.2/24", None);
        alice.identity.public_key = "server-public".to_string();
        assert!(render_server_config(51820, &server_identity(), &[alice]).is_err());
    }

    #[test]
    fn test_builder_matches_render() {
        let alice = client("alice", 2, "10.66.0.2/24", None);
        let built = ServerConfigBuilder::new(51820)
            .peer(&alice)
            .unwrap()
            .build();
        let rendered = render_server_config(51820, &server_identity(), &[alice]).unwrap();
        assert_eq!(built, rendered);
    }

    #[test]
    fn test_client_config_text() {
        let alice = client("alice", 2, "10.66.0.2/24", None);
        let doc =
            render_client_config(&alice, "server-public", &Endpoint::new("vpn.example.org", 51820))
                .unwrap();
        assert_eq!(doc.name(), "alice");
        assert_eq!(
            doc.as_str(),
            "[Interface]\n\
             PrivateKey = alice-private\n\
             Address = 10.66.0.2/24\n\
             \n\
             [Peer]\n\
             PublicKey = server-public\n\
             PresharedKey = alice-psk\n\
             AllowedIPs = 0.0.0.0/0\n\
             Endpoint = vpn.example.org:51820\n"
        );
    }

    #[test]
    fn test_client_config_dual_stack() {
        let alice = client("alice", 2, "10.66.0.2/24", Some("fd00:1::7767:0:0:2/64"));
        let doc =
            render_client_config(&alice, "server-public", &Endpoint::new("vpn.example.org", 51820))
                .unwrap();
        assert!(doc
            .as_str()
            .contains("Address = 10.66.0.2/24, fd00:1::7767:0:0:2/64\n"));
        assert!(doc.as_str().contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
    }

    #[test]
    fn test_client_config_is_deterministic() {
        let alice = client("alice", 2, "10.66.0.2/24", Some("fd00:1::7767:0:0:2/64"));
        let endpoint = Endpoint::new("vpn.example.org", 51820);
        let a = render_client_config(&alice, "server-public", &endpoint).unwrap();
        let b = render_client_config(&alice, "server-public", &endpoint).unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_client_config_requires_server_key() {
        let alice = client("alice", 2, "10.66.0.2/24", None);
        assert!(render_client_config(&alice, "", &Endpoint::new("vpn", 51820)).is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::new("vpn.example.org", 51820).to_string(),
            "vpn.example.org:51820"
        );
        assert_eq!(Endpoint::new("192.0.2.1", 51820).to_string(), "192.0.2.1:51820");
        assert_eq!(
            Endpoint::new("2001:db8::1", 51820).to_string(),
            "[2001:db8::1]:51820"
        );
    }

    #[test]
    fn test_interface_script() {
        let server = Allocation {
            ordinal: 1,
            ipv4: "10.66.0.1/24".parse().unwrap(),
            ipv6: None,
        };
        let script = render_interface_script(
            "wg0",
            &server,
            "/etc/wireguard/wg0.conf",
            "/etc/wireguard/server.key",
        );
        assert_eq!(
            script,
            "inet 10.66.0.1 255.255.255.0 NONE description \"wireguard\"\n\
             up\n\
             \n\
             !/usr/local/bin/wg setconf wg0 /etc/wireguard/wg0.conf\n\
             !/usr/local/bin/wg set wg0 private-key /etc/wireguard/server.key\n"
        );
    }

    #[test]
    fn test_interface_script_dual_stack() {
        let server = Allocation {
            ordinal: 1,
            ipv4: "10.66.0.1/24".parse().unwrap(),
            ipv6: Some("fd00:1::7767:0:0:1/64".parse().unwrap()),
        };
        let script = render_interface_script("wg0", &server, "/a", "/b");
        assert!(script.contains("\ninet6 fd00:1::7767:0:0:1 64\nup\n"));
    }
}
