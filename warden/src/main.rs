//! Warden - host platform for the secure IPC core
//!
//! Boots a simulated dual-core board from a service manifest and drives the
//! mailbox from a scripted non-secure client.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::board::Board;
use warden::config::WardenConfig;
use warden::script::Scenario;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Warden - secure IPC host platform
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Service manifest path
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "/etc/warden/warden.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the manifest and print the service table
    Check,

    /// Boot the board and run a client scenario
    Run {
        /// Scenario file
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Warden v{} starting", VERSION);

    let config = WardenConfig::load(&args.config)?;

    match args.command {
        Commands::Check => check(&config),
        Commands::Run { scenario } => run(&config, &scenario).await,
    }
}

fn check(config: &WardenConfig) -> Result<()> {
    config.validate()?;
    let (services, _) = config.directory_tables();

    println!("{:<24} {:>10} {:>8} {:>10} {:>10}", "SERVICE", "SID", "VERSION", "PARTITION", "STATIC");
    for service in &services {
        let index = service
            .stateless_index
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:>#10x} {:>8} {:>10} {:>10}",
            service.name.as_str(),
            service.sid,
            service.version,
            service.partition,
            index
        );
    }
    println!(
        "{} services, {} partitions, {} mailbox slots",
        services.len(),
        config.partitions.len(),
        config.mailbox.slots
    );
    Ok(())
}

async fn run(config: &WardenConfig, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let board = Board::boot(config)?;
    let client = board.ns_client();

    let results = scenario.run(&client, config).await;
    board.shutdown().await;

    for result in results? {
        match result.error() {
            Some(err) => println!("[{:>2}] {:<18} {} ({})", result.step, result.op, result.value, err),
            None => println!("[{:>2}] {:<18} {:#x}", result.step, result.op, result.value),
        }
        for (i, out) in result.output.iter().enumerate() {
            println!("       out[{}] {:?}", i, out);
        }
        if result.error().is_some() {
            warn!("step {} failed with {}", result.step, result.value);
        }
    }
    Ok(())
}
