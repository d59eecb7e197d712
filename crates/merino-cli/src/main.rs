#![deny(unsafe_code)]

//! Merino CLI — command-line control plane for the sheep daemon.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use merino_core::ipc::IpcClient;

/// Merino — a fleet worker that runs untrusted test harnesses in sandboxes.
#[derive(Parser)]
#[command(name = "merino", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "merino.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sheep daemon.
    Start,

    /// Stop a running sheep daemon.
    Stop,

    /// Show daemon status.
    Status,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing subscriber with verbosity level
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Start => cmd_start(&cli.config).await?,
        Commands::Stop => cmd_stop(&cli.config).await?,
        Commands::Status => cmd_status(&cli.config).await?,
        Commands::Config { show } => cmd_config(&cli.config, show).await?,
    }

    Ok(())
}

async fn cmd_start(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    info!("Starting merino sheep daemon");

    let sheep = merino_core::Sheep::new(config);
    sheep.run().await.map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}

async fn cmd_stop(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let client = IpcClient::new(&config.daemon.socket_path);

    let stop = client.stop().await?;
    println!("{}", stop.message);
    Ok(())
}

async fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let client = IpcClient::new(&config.daemon.socket_path);

    let status = client.status().await?;
    println!("merino {} ({})", status.version, status.git_hash);
    println!("  pid:             {}", status.pid);
    println!("  uptime:          {}s", status.uptime_secs);
    println!("  shepherd:        {} [{}]", status.shepherd_endpoint, status.session);
    println!(
        "  queue:           {}/{}",
        status.queue_depth, status.queue_capacity
    );
    println!("  workers:         {}", status.pool_size);
    println!("  orphans pending: {}", status.orphans_pending);
    println!("  provider:        {}", status.provider_backend);
    println!("  log level:       {}", status.log_level);
    Ok(())
}

async fn cmd_config(config_path: &Path, show: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    if show {
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<merino_config::AppConfig> {
    if path.exists() {
        merino_config::AppConfig::load(path)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(merino_config::AppConfig::default())
    }
}
