use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labchain_crypto::LocalKeyDeriver;
use labchain_node::config::{NodeConfig, DEFAULT_CONFIG_FILE};
use labchain_node::{logging, LabchainNode};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "labchain")]
#[command(about = "Labchain orchestrator - reviewed algorithm runs over shared lab datasets", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Start {
        /// Data directory for state, blobs and datasets
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Port for the /health and /metrics endpoint
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Write a default configuration file
    Init {
        /// Output directory for configuration
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Generate a vault master secret
    Keygen {
        /// File to write the hex-encoded secret to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// File settings (or defaults) with environment overrides applied.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            NodeConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => NodeConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (ignore if it doesn't)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Priority order: CLI args > ENV vars > Config file > Defaults
    let mut config = load_config(cli.config.as_deref())?;

    if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        let log_level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| format!("labchain={}", log_level)),
            ))
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }

    match cli.command {
        Commands::Start {
            data_dir,
            metrics_port,
        } => {
            if let Some(data_dir) = data_dir {
                config.set_data_dir(data_dir);
            }
            if let Some(port) = metrics_port {
                config.metrics.port = port;
            }
            config.validate()?;

            let mut node = LabchainNode::new(config).await?;
            node.start().await?;
            info!("✅ NODE READY - All services running");

            tokio::signal::ctrl_c().await?;
            node.shutdown().await;
            Ok(())
        }

        Commands::Init { output } => {
            std::fs::create_dir_all(&output)?;
            let path = output.join("labchain.toml");
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            NodeConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "⚙️ Configuration written");
            Ok(())
        }

        Commands::Keygen { output } => {
            let secret = LocalKeyDeriver::generate().master_hex();
            match output {
                Some(path) => {
                    if path.exists() {
                        bail!("{} already exists", path.display());
                    }
                    std::fs::write(&path, format!("{}\n", secret))?;
                    info!(path = %path.display(), "🔐 Vault secret written");
                }
                None => println!("{}", secret),
            }
            Ok(())
        }
    }
}
