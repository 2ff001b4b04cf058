use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

mod config;
mod runner;
mod signals;

use config::{load_config, mask_password};

#[derive(Parser)]
#[command(name = "walrelay")]
#[command(about = "Replay a logical replication stream of SQL statements into a database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to walrelay.toml config file
    #[arg(short, long, default_value = "walrelay.toml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from the replication slot and apply changes until stopped
    Run,

    /// Validate the config file and print the resolved settings
    Check,
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("walrelay=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run => {
            let config = load_config(&cli.config)?;
            runner::run_relay(config, &cli.config).await
        }
        Commands::Check => cmd_check(&cli.config).map(|()| 0),
    }
}

fn cmd_check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let origin = config.origin_connection_string()?;
    let destination = config.destination_connection_string()?;

    println!("Config OK: {}", path.display());
    println!("  name:                {}", config.name);
    println!("  origin:              {}", mask_password(&origin));
    println!("  slot:                {}", config.origin.slot_name);
    println!("  destination:         {}", mask_password(&destination));
    println!("  database:            {}", config.destination.database);
    println!("  idle_time_ms:        {}", config.session.idle_time_ms);
    println!("  status_interval_ms:  {}", config.session.status_interval_ms);
    match config.guard_policy() {
        Some(policy) => println!(
            "  guard:               only {} may drop {}",
            policy.privileged_user, policy.protected_database
        ),
        None => println!("  guard:               disabled"),
    }

    Ok(())
}
