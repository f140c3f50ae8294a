use anyhow::Result;
use clap::{Parser, Subcommand};
use flockconf::{NodeConfig, NodeDaemon};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flockconf")]
#[command(about = "Configuration node with a hash-chained change ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = "flockconf.toml")]
        config: PathBuf,
    },
    Init {
        #[arg(short, long, default_value = "flockconf.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flockconf=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config: config_path } => {
            run_daemon(config_path).await?;
        }
        Commands::Init { config: config_path } => {
            init_config(config_path)?;
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        info!("Loading config from {:?}", config_path);
        NodeConfig::load(&config_path)?
    } else {
        info!("Config file not found, using defaults");
        NodeConfig::default()
    };

    let daemon = Arc::new(NodeDaemon::new(config).await?);

    let daemon_clone = daemon.clone();
    let daemon_handle = tokio::spawn(async move {
        if let Err(e) = daemon_clone.run().await {
            error!("Daemon error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    daemon.shutdown();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), daemon_handle).await;

    Ok(())
}

fn init_config(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::init(&config_path)?;
    println!(
        "Wrote {:?}: ledger at {:?}, listening on {}",
        config_path,
        config.ledger_dir(),
        config.listen_addr()
    );
    Ok(())
}
