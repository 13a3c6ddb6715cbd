//! Gatehop CLI
//!
//! A command-line interface for the gatehop tunnel controller.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatehop_engine::{Config, ConnectionState, SelectionCriteria, TransportPreference, TunnelController, TunnelEvent};

/// Gatehop - obfuscated tunnel controller
#[derive(Parser)]
#[command(name = "gatehop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gatehop.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the closest gateway and stay connected until interrupted
    Connect(ConnectArgs),

    /// List known gateways, closest first
    Gateways {
        /// Additional gateways as a JSON array
        #[arg(short, long)]
        gateways: Option<PathBuf>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "gatehop.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Additional gateways as a JSON array
    #[arg(short, long)]
    gateways: Option<PathBuf>,

    /// Transport preference (auto, direct, obfs4), overrides the configuration
    #[arg(short, long)]
    transport: Option<TransportPreference>,

    /// Only use gateways at this location
    #[arg(long)]
    location: Option<String>,

    /// Number of closest gateways considered
    #[arg(long)]
    closest: Option<usize>,
}

impl ConnectArgs {
    fn apply(&self, mut criteria: SelectionCriteria) -> SelectionCriteria {
        if let Some(transport) = self.transport {
            criteria.transport = transport;
        }
        if let Some(ref location) = self.location {
            criteria.location = Some(location.clone());
        }
        if let Some(closest) = self.closest {
            criteria.closest = closest;
        }
        criteria
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Connect(args) => run_connect(&cli.config, args).await,
        Commands::Gateways { gateways } => list_gateways(&cli.config, gateways.as_deref()).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_connect(config_path: &Path, args: ConnectArgs) -> Result<()> {
    let controller = create_controller(config_path, args.gateways.as_deref()).await?;
    let criteria = args.apply(controller.default_criteria());

    let mut events = controller.subscribe();
    controller
        .connect(criteria)
        .await
        .context("Failed to start the tunnel")?;

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            received = &mut shutdown => {
                if let Err(e) = received {
                    break Err(e);
                }
                info!("Shutting down tunnel...");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    event.log();
                    if let TunnelEvent::StateChanged { new: ConnectionState::Failed, detail, failure, .. } = event {
                        let kind = failure.map(|k| k.to_string()).unwrap_or_else(|| "error".into());
                        break Err(anyhow!("tunnel failed ({}): {}", kind, detail));
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} tunnel events", missed),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    controller
        .disconnect()
        .await
        .context("Failed to shut the tunnel down")?;

    result
}

async fn list_gateways(config_path: &Path, gateways: Option<&Path>) -> Result<()> {
    let controller = create_controller(config_path, gateways).await?;
    let gateways = controller.gateways().await;

    if gateways.is_empty() {
        println!("No gateways configured");
        return Ok(());
    }

    for gateway in gateways {
        let mut transports = Vec::new();
        if gateway.supports_direct() {
            transports.push("direct");
        }
        if gateway.supports_obfs4() {
            transports.push("obfs4");
        }

        println!(
            "{:<24} {:<16} {:<16} {:>5} {}",
            gateway.label(),
            gateway.ip_address,
            gateway.location.as_deref().unwrap_or("-"),
            gateway
                .timezone
                .map(|tz| format!("{:+}", tz))
                .unwrap_or_else(|| "-".into()),
            transports.join(",")
        );
    }

    Ok(())
}

async fn create_controller(config_path: &Path, gateways: Option<&Path>) -> Result<TunnelController> {
    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let controller = TunnelController::new(config).context("Failed to create tunnel controller")?;

    if let Some(path) = gateways {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateways from {:?}", path))?;
        let added = controller
            .load_gateways_json(&json)
            .await
            .with_context(|| format!("Invalid gateway list in {:?}", path))?;
        info!("Loaded {} gateway(s) from {:?}", added, path);
    }

    Ok(controller)
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the gateway list and the transport bin_dir before connecting.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
