// Provisioning orchestration

//! Provisioning orchestration
//!
//! A run has two halves:
//!
//! 1. Local preparation ([`prepare`], [`write_outputs`]): capacity check,
//!    key material, rendering, and writing client documents and QR codes to
//!    the output directory. Nothing here touches the server.
//! 2. Delivery ([`Orchestrator`]): package install, server documents,
//!    forwarding and packet filter, each a separate step against a
//!    [`RemoteExecutor`].
//!
//! Every fatal condition of the first half aborts the run before anything
//! is uploaded.

use crate::allocator::AddressAllocator;
use crate::error::ProvisionError;
use crate::firewall::{render_pf_conf, FirewallParams};
use crate::host::{run_checked, shell_quote, RemoteExecutor};
use crate::inspect::{check_precondition, HostFacts, NetworkInspector};
use crate::keystore::{create_private_dir, replace_owner_only, KeyGenerator, KeyStore};
use crate::render::{
    render_client_config, render_interface_script, render_server_config, ClientConfigDocument,
    Endpoint, ServerConfigDocument,
};
use crate::sysctl::{setting_line, upsert_line, IPV4_FORWARDING, IPV6_FORWARDING};
use crate::tools::QrEncoder;
use crate::types::{AllocatedClient, Allocation, Config, Identity, NetworkBlock};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Package providing `wg`
const WIREGUARD_PACKAGE: &str = "wireguard-tools";

/// Server-side configuration directory
const REMOTE_WG_DIR: &str = "/etc/wireguard";

const SYSCTL_CONF: &str = "/etc/sysctl.conf";
const PF_CONF: &str = "/etc/pf.conf";

/// Everything a run computes before touching the server
#[derive(Debug, Clone)]
pub struct Prepared {
    pub block: NetworkBlock,
    pub server_identity: Identity,
    pub server_allocation: Allocation,
    pub clients: Vec<AllocatedClient>,
    pub server_config: ServerConfigDocument,
    pub client_configs: Vec<ClientConfigDocument>,
    /// `hostname.<if>` bring-up script
    pub interface_script: String,
}

/// Remote file locations for an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    pub private_key: String,
    pub config: String,
    pub interface_script: String,
}

impl RemotePaths {
    /// Paths used for `interface`
    pub fn for_interface(interface: &str) -> Self {
        Self {
            private_key: format!("{}/server.key", REMOTE_WG_DIR),
            config: format!("{}/{}.conf", REMOTE_WG_DIR, interface),
            interface_script: format!("/etc/hostname.{}", interface),
        }
    }
}

/// Allocate, ensure keys and render every document
///
/// The roster is checked against the address blocks before the first key is
/// generated, so an oversized roster leaves the materials directory as it
/// was.
pub fn prepare<G: KeyGenerator>(
    config: &Config,
    block: NetworkBlock,
    keys: &mut KeyStore<G>,
) -> Result<Prepared, ProvisionError> {
    let allocator = AddressAllocator::new(block);
    let plan = allocator.plan(&config.roster.clients)?;
    let server_allocation = allocator.server_allocation()?;

    let server_identity = keys.ensure_server_identity()?;

    let mut clients = Vec::with_capacity(plan.len());
    for (name, allocation) in plan {
        let identity = keys.ensure_client_identity(name)?;
        log::debug!(
            "{} -> ordinal {} ({})",
            name,
            allocation.ordinal,
            allocation.interface_addresses().join(", ")
        );
        clients.push(AllocatedClient {
            name: name.to_string(),
            allocation,
            identity,
        });
    }

    let server_config =
        render_server_config(config.general.listen_port, &server_identity, &clients)?;

    let endpoint = Endpoint::new(config.general.endpoint_host(), config.general.listen_port);
    let client_configs = clients
        .iter()
        .map(|client| render_client_config(client, &server_identity.public_key, &endpoint))
        .collect::<Result<Vec<_>, _>>()?;

    let paths = RemotePaths::for_interface(&config.general.interface);
    let interface_script = render_interface_script(
        &config.general.interface,
        &server_allocation,
        &paths.config,
        &paths.private_key,
    );

    Ok(Prepared {
        block: *allocator.block(),
        server_identity,
        server_allocation,
        clients,
        server_config,
        client_configs,
        interface_script,
    })
}

/// Files produced by [`write_outputs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputReport {
    pub documents: Vec<PathBuf>,
    pub qr_codes: Vec<PathBuf>,
}

/// Write rendered documents to the output directory
///
/// Client documents embed private keys and are written owner-only. QR codes
/// are best effort and only attempted when an encoder is given.
pub fn write_outputs(
    config: &Config,
    prepared: &Prepared,
    qr: Option<&QrEncoder>,
) -> Result<OutputReport, ProvisionError> {
    let dir = &config.general.output_dir;
    create_private_dir(dir)?;

    let mut report = OutputReport::default();

    let server_path = dir.join(format!("{}.conf", config.general.interface));
    replace_owner_only(&server_path, prepared.server_config.as_str().as_bytes(), false)?;
    report.documents.push(server_path);

    for doc in &prepared.client_configs {
        let path = dir.join(format!("{}.conf", doc.name()));
        replace_owner_only(&path, doc.as_str().as_bytes(), false)?;
        report.documents.push(path);

        if let Some(encoder) = qr {
            let png = dir.join(format!("{}.png", doc.name()));
            if encoder.encode_png(doc.as_str(), &png) {
                report.qr_codes.push(png);
            }
        }
    }

    log::info!(
        "Wrote {} documents and {} QR codes to {}",
        report.documents.len(),
        report.qr_codes.len(),
        dir.display()
    );
    Ok(report)
}

/// Timing of the post-upgrade reboot wait
#[derive(Debug, Clone, Copy)]
pub struct RebootWait {
    /// Pause before the first poll
    pub delay: Duration,
    /// Pause between polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for RebootWait {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Sequences delivery steps against one server
pub struct Orchestrator<'a, R: ?Sized, N: ?Sized> {
    config: &'a Config,
    exec: &'a R,
    inspector: &'a N,
}

impl<'a, R, N> Orchestrator<'a, R, N>
where
    R: RemoteExecutor + ?Sized,
    N: NetworkInspector + ?Sized,
{
    /// Create an orchestrator for the server described by `config`
    pub fn new(config: &'a Config, exec: &'a R, inspector: &'a N) -> Self {
        Self {
            config,
            exec,
            inspector,
        }
    }

    /// Run the whole provisioning sequence
    pub async fn provision<G: KeyGenerator>(
        &self,
        keys: &mut KeyStore<G>,
        qr: Option<&QrEncoder>,
    ) -> Result<Prepared> {
        let facts = self.check_host().await?;
        let uplink = self
            .inspector
            .default_interface()
            .await
            .context("Failed to find uplink interface")?;
        log::info!("Uplink interface: {}", uplink);

        let block = self.resolve_network(&uplink).await?;
        let prepared = prepare(self.config, block, keys).context("Local preparation failed")?;
        write_outputs(self.config, &prepared, qr).context("Failed to write documents")?;

        self.check_server_key(&prepared).await?;
        self.install_package(&facts).await?;
        self.push_interface(&prepared).await?;
        self.enable_forwarding(prepared.block.ipv6.is_some()).await?;
        self.apply_firewall(&uplink, &prepared.block).await?;

        log::info!(
            "Provisioned {} with {} peers",
            self.exec.target(),
            prepared.server_config.peer_count()
        );
        Ok(prepared)
    }

    /// Fail unless the host runs a supported release
    pub async fn check_host(&self) -> Result<HostFacts> {
        let facts = self
            .inspector
            .host_facts()
            .await
            .context("Failed to gather host facts")?;
        log::info!(
            "{} runs release {} on {}{}",
            self.exec.target(),
            facts.os_version,
            facts.arch,
            if facts.is_snapshot() { " (snapshot)" } else { "" }
        );
        check_precondition(&facts, &self.config.host)?;
        Ok(facts)
    }

    /// Configured blocks, with the uplink's IPv6 prefix filled in if asked
    pub async fn resolve_network(&self, uplink: &str) -> Result<NetworkBlock> {
        let mut block = self.config.network_block();
        if block.ipv6.is_some() || !self.config.network.discover_ipv6 {
            return Ok(block);
        }

        match self.inspector.ipv6_prefix(uplink).await? {
            Some(prefix) if prefix.prefix_len() <= crate::allocator::MAX_IPV6_PREFIX_LEN => {
                log::info!("Using IPv6 prefix {} of {}", prefix, uplink);
                block.ipv6 = Some(prefix);
            }
            Some(prefix) => {
                log::warn!(
                    "IPv6 prefix {} on {} is too long for client addresses, staying IPv4-only",
                    prefix,
                    uplink
                );
            }
            None => log::info!("No IPv6 prefix on {}, staying IPv4-only", uplink),
        }
        Ok(block)
    }

    /// Install the WireGuard tools unless already present
    pub async fn install_package(&self, facts: &HostFacts) -> Result<()> {
        let check = format!("pkg_info -e {}", shell_quote(&format!("{}-*", WIREGUARD_PACKAGE)));
        let installed = self.exec.run(&check).await?.success;
        if installed {
            log::info!("{} already installed", WIREGUARD_PACKAGE);
            return Ok(());
        }

        let install = match facts.snapshot_pkg_path() {
            Some(pkg_path) => format!(
                "env PKG_PATH={} pkg_add {}",
                shell_quote(&pkg_path),
                WIREGUARD_PACKAGE
            ),
            None => format!("pkg_add {}", WIREGUARD_PACKAGE),
        };
        log::info!("Installing {}", WIREGUARD_PACKAGE);
        run_checked(self.exec, &install)
            .await
            .with_context(|| format!("Failed to install {}", WIREGUARD_PACKAGE))?;
        Ok(())
    }

    /// Compare the host's server key with the local one
    ///
    /// Returns `true` when the host already holds the same key. A different
    /// key on the host means the local materials directory is not the one
    /// the server was provisioned from; replacing that key would invalidate
    /// every distributed client document, so the run fails instead.
    pub async fn check_server_key(&self, prepared: &Prepared) -> Result<bool> {
        let paths = RemotePaths::for_interface(&self.config.general.interface);
        let remote = self
            .exec
            .download(&paths.private_key)
            .await
            .context("Failed to read server key on host")?;

        match remote {
            None => Ok(false),
            Some(bytes) => {
                let remote_key = String::from_utf8_lossy(&bytes);
                if remote_key.trim() == prepared.server_identity.private_key {
                    Ok(true)
                } else {
                    Err(ProvisionError::Precondition(format!(
                        "{} on {} holds a different server key than {}; \
                         point materials_dir at the store this server was provisioned from",
                        paths.private_key,
                        self.exec.target(),
                        self.config.general.materials_dir.display()
                    ))
                    .into())
                }
            }
        }
    }

    /// Upload the server key (unless already present), peer document and
    /// bring-up script, then start the interface
    pub async fn push_interface(&self, prepared: &Prepared) -> Result<()> {
        let interface = &self.config.general.interface;
        let paths = RemotePaths::for_interface(interface);

        let key_present = self.check_server_key(prepared).await?;

        run_checked(self.exec, &format!("install -d -m 700 {}", REMOTE_WG_DIR))
            .await
            .context("Failed to create WireGuard directory")?;

        if key_present {
            log::debug!("Server key already installed");
        } else {
            let private_key = format!("{}\n", prepared.server_identity.private_key);
            self.exec
                .upload(private_key.as_bytes(), &paths.private_key, 0o600)
                .await
                .context("Failed to upload server key")?;
        }
        self.exec
            .upload(prepared.server_config.as_str().as_bytes(), &paths.config, 0o600)
            .await
            .context("Failed to upload server config")?;
        self.exec
            .upload(
                prepared.interface_script.as_bytes(),
                &paths.interface_script,
                0o640,
            )
            .await
            .context("Failed to upload interface script")?;

        log::info!("Bringing up {}", interface);
        run_checked(self.exec, &format!("sh /etc/netstart {}", interface))
            .await
            .with_context(|| format!("Failed to configure {}", interface))?;
        Ok(())
    }

    /// Enable forwarding now and persist it in `sysctl.conf`
    pub async fn enable_forwarding(&self, ipv6: bool) -> Result<()> {
        let mut keys = vec![IPV4_FORWARDING];
        if ipv6 {
            keys.push(IPV6_FORWARDING);
        }

        for key in &keys {
            run_checked(self.exec, &format!("sysctl {}", setting_line(key, "1")))
                .await
                .with_context(|| format!("Failed to enable {}", key))?;
        }

        let current = self
            .exec
            .download(SYSCTL_CONF)
            .await
            .context("Failed to read sysctl.conf")?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        let mut contents = current;
        let mut changed = false;
        for key in &keys {
            let (updated, did_change) = upsert_line(&contents, key, &setting_line(key, "1"));
            contents = updated;
            changed |= did_change;
        }

        if changed {
            log::info!("Persisting forwarding in {}", SYSCTL_CONF);
            self.exec
                .upload(contents.as_bytes(), SYSCTL_CONF, 0o644)
                .await
                .context("Failed to write sysctl.conf")?;
        } else {
            log::debug!("{} already up to date", SYSCTL_CONF);
        }
        Ok(())
    }

    /// Install the packet filter ruleset and (re)load it
    pub async fn apply_firewall(&self, uplink: &str, block: &NetworkBlock) -> Result<()> {
        let ruleset = render_pf_conf(&FirewallParams {
            uplink,
            vpn_interface: &self.config.general.interface,
            listen_port: self.config.general.listen_port,
            ipv4: block.ipv4,
            ipv6: block.ipv6,
        });
        self.exec
            .upload(ruleset.as_bytes(), PF_CONF, 0o600)
            .await
            .context("Failed to upload pf.conf")?;

        // `pfctl -e` fails when pf is already enabled
        run_checked(self.exec, "pfctl -f /etc/pf.conf && { pfctl -e || true; }")
            .await
            .context("Failed to load pf.conf")?;
        Ok(())
    }

    /// Upgrade to the latest snapshot, reboot and update packages
    pub async fn upgrade(&self, wait: RebootWait) -> Result<()> {
        log::info!("Upgrading {} to the latest snapshot", self.exec.target());
        run_checked(self.exec, "sysupgrade -s -n")
            .await
            .context("sysupgrade failed")?;

        // The connection usually drops before the command returns
        match self.exec.run("reboot").await {
            Ok(_) => log::debug!("Reboot issued"),
            Err(e) => log::debug!("Reboot command ended with: {:#}", e),
        }

        self.wait_for_host(wait).await?;

        log::info!("Updating packages");
        run_checked(self.exec, "pkg_add -u")
            .await
            .context("Package update failed")?;
        Ok(())
    }

    async fn wait_for_host(&self, wait: RebootWait) -> Result<()> {
        tokio::time::sleep(wait.delay).await;

        let poll = async {
            loop {
                match self.exec.run("uname -r").await {
                    Ok(output) if output.success => return output.stdout,
                    _ => tokio::time::sleep(wait.interval).await,
                }
            }
        };

        let release = tokio::time::timeout(wait.timeout, poll)
            .await
            .with_context(|| {
                format!(
                    "{} did not come back within {}s",
                    self.exec.target(),
                    wait.timeout.as_secs()
                )
            })?;
        log::info!("{} is back, running {}", self.exec.target(), release.trim());
        Ok(())
    }
}
