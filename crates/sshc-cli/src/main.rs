//! Operator CLI for the SSH connectivity core.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshc_core::config::{default_data_dir, CoreConfig};
use sshc_core::instance::InstanceId;
use sshc_core::keystore::KeyStore;
use sshc_core::orchestrator::MockOrchestrator;
use sshc_manager::SshManager;
use sshc_tunnels::TunnelManager;

use sshc_cli::{fleet, output};

#[derive(Parser)]
#[command(name = "sshc")]
#[command(author, version, about = "SSH connectivity core operator CLI")]
struct Cli {
    /// Directory holding the signing key and TOFU host-key store.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Mock fleet file (TOML) registering instances for local smoke-testing.
    #[arg(long, global = true)]
    fleet: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an instance and print its resulting status.
    Connect { instance: u64 },

    /// Show status for one instance, or every known instance.
    Status { instance: Option<u64> },

    /// List every live session.
    List,

    /// Close an instance's session and tear down its tunnels.
    Close { instance: u64 },

    /// Run the `ping` logical channel round trip against an instance.
    Ping { instance: u64 },

    /// Run as a standalone process: register the fleet, connect everything,
    /// and keep the reconciler and health checks alive until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut config = CoreConfig::default();
    config.data_dir = data_dir.clone();

    let keystore = KeyStore::ensure(&data_dir).context("loading signing key")?;
    let orchestrator = Arc::new(MockOrchestrator::new());

    if let Some(path) = &cli.fleet {
        let entries = fleet::load_fleet(path).context("loading fleet file")?;
        fleet::register_fleet(&orchestrator, &entries);
        println!("registered {} instance(s) from {}", entries.len(), path.display());
    }

    let ssh = SshManager::new(config.clone(), &keystore, orchestrator.clone())
        .context("initializing SSH manager")?;
    let tunnels = TunnelManager::new(ssh.clone(), orchestrator.clone(), config.clone());
    tunnels.spawn_health_checks();
    tunnels.spawn_reconciler();

    match cli.command {
        Commands::Connect { instance } => {
            let instance = InstanceId(instance);
            ssh.connect(instance, None, None).await.context("connect failed")?;
            if let Some(status) = ssh.status(instance).await {
                println!("{}", output::format_status_detail(&status, &tunnels.tunnel_statuses(instance)));
            }
        }
        Commands::Status { instance: Some(instance) } => {
            let instance = InstanceId(instance);
            match ssh.status(instance).await {
                Some(status) => println!(
                    "{}",
                    output::format_status_detail(&status, &tunnels.tunnel_statuses(instance))
                ),
                None => println!("no session for instance {instance}"),
            }
        }
        Commands::Status { instance: None } | Commands::List => {
            let instances = ssh.list_instances().await;
            let mut statuses = Vec::with_capacity(instances.len());
            for instance in instances {
                if let Some(status) = ssh.status(instance).await {
                    statuses.push(status);
                }
            }
            println!("{}", output::format_instance_list(&statuses));
        }
        Commands::Close { instance } => {
            let instance = InstanceId(instance);
            ssh.close(instance).await.context("close failed")?;
            println!("closed instance {instance}");
        }
        Commands::Ping { instance } => {
            let instance = InstanceId(instance);
            sshc_tunnels::ping(&ssh, instance, Duration::from_secs(3))
                .await
                .context("ping failed")?;
            println!("pong from instance {instance}");
        }
        Commands::Run => {
            println!("sshc running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.ok();
        }
    }

    Ok(())
}
