// PF ruleset rendering

//! Packet filter configuration
//!
//! Renders the `pf.conf` installed on the VPN server. It keeps the stock
//! OpenBSD layout (`block return` then `pass`; the last matching rule wins,
//! so traffic passes unless a later rule blocks it) and adds the VPN rules:
//! the listen port is accepted on the uplink, traffic passes on the VPN
//! interface and the VPN networks leave through the uplink, IPv4 NATed.

use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt::Write as _;

/// Inputs of the firewall template
#[derive(Debug, Clone)]
pub struct FirewallParams<'a> {
    /// Uplink interface (default route)
    pub uplink: &'a str,
    /// VPN interface
    pub vpn_interface: &'a str,
    pub listen_port: u16,
    pub ipv4: Ipv4Net,
    pub ipv6: Option<Ipv6Net>,
}

/// Render `pf.conf`
pub fn render_pf_conf(params: &FirewallParams<'_>) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "ext_if = \"{}\"", params.uplink);
    let _ = writeln!(text, "wg_if = \"{}\"", params.vpn_interface);
    let _ = writeln!(text);
    let _ = writeln!(text, "set skip on lo");
    let _ = writeln!(text);
    // Stock defaults; the management SSH session relies on the bare pass
    let _ = writeln!(text, "block return");
    let _ = writeln!(text, "pass");
    let _ = writeln!(text);
    let _ = writeln!(
        text,
        "pass in on $ext_if proto udp to port {}",
        params.listen_port
    );
    let _ = writeln!(text, "pass in on $wg_if");
    let _ = writeln!(
        text,
        "pass out on $ext_if inet from {} nat-to ($ext_if)",
        params.ipv4.trunc()
    );
    if let Some(v6) = params.ipv6 {
        let _ = writeln!(text, "pass out on $ext_if inet6 from {}", v6.trunc());
    }
    let _ = writeln!(text);
    let _ = writeln!(text, "block return in on ! lo0 proto tcp to port 6000:6010");
    text
}
