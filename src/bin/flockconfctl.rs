use anyhow::Result;
use clap::{Parser, Subcommand};
use flockconf::{
    ChangeCoordinator, ConfigChange, CoordinatorSettings, HttpEndpoint, NomadEndpoint,
};
use serde_json::Value;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flockconfctl")]
#[command(about = "Operator CLI for coordinated configuration changes")]
struct Cli {
    /// Comma-separated node addresses (host:port)
    #[arg(short, long, value_delimiter = ',', default_value = "127.0.0.1:9410")]
    servers: Vec<String>,

    #[arg(short, long)]
    user: Option<String>,

    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Status,
    Set {
        setting: String,
        value: String,
    },
    Unset {
        setting: String,
    },
    Recover,
    History {
        /// Node to read the history from (defaults to the first server)
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = CoordinatorSettings {
        user: cli.user.clone(),
        request_timeout_ms: cli.timeout_ms,
        ..CoordinatorSettings::default()
    };
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let coordinator = ChangeCoordinator::new(settings.to_coordinator_options(host));

    let targets: Vec<Arc<dyn NomadEndpoint>> = cli
        .servers
        .iter()
        .map(|addr| Arc::new(HttpEndpoint::new(addr.clone())) as Arc<dyn NomadEndpoint>)
        .collect();

    match cli.command {
        Commands::Status => {
            let analyzer = coordinator.discover(&targets).await?;
            println!("Cluster state: {}", analyzer.global_state());
            for (addr, response) in analyzer.responses() {
                println!(
                    "  {}: mode={} version={} highest={} count={}",
                    addr,
                    response.mode,
                    response.current_version,
                    response.highest_version,
                    response.mutative_message_count
                );
            }
            for (addr, reason) in analyzer.failures() {
                println!("  {}: unreachable ({})", addr, reason);
            }
            if let Some(details) = analyzer.inconsistency() {
                println!("Inconsistency: {}", details);
            }
        }
        Commands::Set { setting, value } => {
            submit(&coordinator, &targets, ConfigChange::set(&setting, &value)).await?;
        }
        Commands::Unset { setting } => {
            submit(&coordinator, &targets, ConfigChange::unset(&setting)).await?;
        }
        Commands::Recover => {
            let outcome = coordinator.recover(&targets).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_resolved() {
                anyhow::bail!("Recovery did not complete");
            }
        }
        Commands::History { server } => {
            let addr = match server.or_else(|| cli.servers.first().cloned()) {
                Some(addr) => addr,
                None => anyhow::bail!("Specify --server"),
            };
            let resp: Value = reqwest::Client::new()
                .get(format!("http://{}/history", addr))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}

async fn submit(
    coordinator: &ChangeCoordinator,
    targets: &[Arc<dyn NomadEndpoint>],
    change: ConfigChange,
) -> Result<()> {
    let outcome = coordinator.submit_change(targets, change).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_applied() {
        anyhow::bail!("Change was not applied");
    }
    Ok(())
}
