// WireGuard Hub-and-Spoke Provisioning CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wg_provision::{
    allocator::AddressAllocator,
    config::load_config,
    host::{LocalExecutor, RemoteExecutor, SshExecutor},
    inspect::{LocalInspector, NetworkInspector, RemoteInspector},
    keystore::{KeyGenerator, KeyStore, NativeKeyGenerator},
    provision::{self, Orchestrator, RebootWait},
    tools::{QrEncoder, WgToolKeyGenerator},
    types::{Config, KeygenKind, FIRST_CLIENT_ORDINAL},
};

/// Target name that selects the local machine instead of SSH
const LOCAL_HOST: &str = "localhost";

#[derive(Parser)]
#[command(name = "wg-provision")]
#[command(about = "Hub-and-spoke WireGuard provisioning", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wg-provision.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Generate keys and write documents locally, without contacting the server
    Render,
    /// Print the ordinal and address of every roster slot
    Plan,
    /// Provision the server and write client documents
    Provision,
    /// Upgrade the server to the latest snapshot and update packages
    Upgrade,
}

fn key_generator(kind: KeygenKind) -> Box<dyn KeyGenerator> {
    match kind {
        KeygenKind::Native => Box::new(NativeKeyGenerator),
        KeygenKind::WgTool => Box::new(WgToolKeyGenerator::default()),
    }
}

fn open_keystore(config: &Config) -> Result<KeyStore<Box<dyn KeyGenerator>>> {
    KeyStore::open(
        &config.general.materials_dir,
        key_generator(config.general.keygen),
    )
    .with_context(|| {
        format!(
            "Failed to open materials directory {}",
            config.general.materials_dir.display()
        )
    })
}

fn qr_encoder(config: &Config) -> Option<QrEncoder> {
    config.general.qr_codes.then(QrEncoder::default)
}

fn print_plan(config: &Config) -> Result<()> {
    let allocator = AddressAllocator::new(config.network_block());
    let roster = &config.roster.clients;
    allocator.check_roster(roster)?;

    let server = allocator.server_allocation()?;
    println!(
        "{:>7}  {:<20}  {}",
        server.ordinal,
        "(server)",
        server.interface_addresses().join(", ")
    );

    for (ordinal, slot) in (FIRST_CLIENT_ORDINAL..).zip(roster.slots()) {
        match slot {
            Some(name) => {
                let allocation = allocator.allocate(ordinal)?;
                println!(
                    "{:>7}  {:<20}  {}",
                    ordinal,
                    name,
                    allocation.interface_addresses().join(", ")
                );
            }
            None => println!("{:>7}  {:<20}  -", ordinal, "(empty)"),
        }
    }

    println!(
        "{} of {} client addresses used",
        roster.len(),
        allocator.capacity().saturating_sub(1)
    );
    Ok(())
}

fn render_local(config: &Config) -> Result<()> {
    let mut keys = open_keystore(config)?;
    let prepared = provision::prepare(config, config.network_block(), &mut keys)?;
    let qr = qr_encoder(config);
    let report = provision::write_outputs(config, &prepared, qr.as_ref())?;
    for path in report.documents.iter().chain(&report.qr_codes) {
        println!("{}", path.display());
    }
    Ok(())
}

async fn run_on_host<R, N>(command: Command, config: &Config, exec: &R, inspector: &N) -> Result<()>
where
    R: RemoteExecutor + ?Sized,
    N: NetworkInspector + ?Sized,
{
    let orchestrator = Orchestrator::new(config, exec, inspector);
    match command {
        Command::Provision => {
            let mut keys = open_keystore(config)?;
            let qr = qr_encoder(config);
            let prepared = orchestrator
                .provision(&mut keys, qr.as_ref())
                .await
                .with_context(|| format!("Provisioning {} failed", exec.target()))?;
            log::info!(
                "Client documents for {} clients are in {}",
                prepared.clients.len(),
                config.general.output_dir.display()
            );
            Ok(())
        }
        Command::Upgrade => orchestrator
            .upgrade(RebootWait::default())
            .await
            .with_context(|| format!("Upgrading {} failed", exec.target())),
        Command::Render | Command::Plan => Ok(()),
    }
}

async fn async_main(args: Args, config: Config) -> Result<()> {
    if config.general.host == LOCAL_HOST {
        let exec = LocalExecutor;
        let inspector = LocalInspector::default();
        run_on_host(args.command, &config, &exec, &inspector).await
    } else {
        let exec = SshExecutor::new(config.general.host.clone());
        let inspector = RemoteInspector::new(&exec);
        run_on_host(args.command, &config, &exec, &inspector).await
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    match args.command {
        Command::Plan => print_plan(&config),
        Command::Render => render_local(&config),
        Command::Provision | Command::Upgrade => {
            // One run talks to one server; no need for worker threads
            let runtime = tokio::runtime::Builder::new_current_thread()
                .thread_name("wg-provision")
                .enable_all()
                .build()?;
            runtime.block_on(async_main(args, config))
        }
    }
}
