use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sigrelay::{get_config_path, Config, SignalServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sigrelay")]
#[command(about = "WebRTC signaling relay over secure WebSockets", long_about = None)]
struct Cli {
    /// Config file (default: ~/.sigrelay/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the signaling relay
    Start {
        /// Override the configured bind address
        #[arg(long)]
        addr: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging - default to info, override with RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sigrelay=info,sigrelay_relay=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let (config_path, mut config) = match cli.config {
        Some(path) => {
            let config = Config::load_from(&path)?;
            (path, config)
        }
        None => (get_config_path(), Config::load()?),
    };

    match cli.command {
        Commands::Start { addr } => {
            if let Some(addr) = addr {
                config.server.bind_address = addr;
            }

            // No partial startup without a certificate
            config.tls.ensure_present()?;

            let server = SignalServer::from_config(&config);

            println!("Starting sigrelay on {}", config.server.bind_address);
            println!("Config: {}", config_path.display());
            println!("Certificate: {}", config.tls.cert_path.display());
            println!("Static files: {}", config.assets.static_dir.display());
            println!(
                "Signaling: wss://{}/{}/<peer_id>",
                config.server.bind_address, config.server.ws_prefix
            );

            server.run().await?;
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config)
                .context("Failed to render config")?;
            println!("# {}", config_path.display());
            print!("{}", rendered);
        }
    }

    Ok(())
}
