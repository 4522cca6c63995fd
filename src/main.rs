use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpool::{Config, DhcpServer, Result};

#[derive(Parser)]
#[command(name = "dhcpool")]
#[command(author, version, about = "A DHCPv4 lease server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on UDP port 67 until Ctrl-C.
    Run,
    /// Print the effective configuration as JSON.
    ShowConfig,
    /// Validate the configuration and print the pool summary.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => {
            let network = config.build_network()?;
            let stats = network.stats();
            println!("Configuration OK: {}", cli.config.display());
            println!(
                "Range {} - {} ({} addresses), lease {}s, T1 {}s, T2 {}s",
                network.range_start(),
                network.range_end(),
                stats.capacity,
                config.lease_duration_seconds,
                config.renewal_time(config.lease_duration_seconds),
                config.rebinding_time(config.lease_duration_seconds)
            );
            Ok(())
        }
    }
}
