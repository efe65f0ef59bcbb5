//! edgehub binary
//!
//! Loads the hub configuration, starts the hub core with the MQTT upstream
//! and waits for SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use edgehub::cloud::MqttUpstream;
use edgehub::config::HubConfig;
use edgehub::observability::{init_default_logging, metrics, HealthServer};
use edgehub::Hub;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: &[&str] = &["edgehub.toml", "config/edgehub.toml"];

#[derive(Parser)]
#[command(name = "edgehub")]
#[command(about = "Edge gateway core: upstream links, message routing and store-and-forward")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EDGEHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub until SIGINT or SIGTERM
    Run {
        /// Connect upstream over plain TCP (local test brokers only)
        #[arg(long)]
        no_tls: bool,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print the parsed route table
    Routes,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { no_tls } => run_hub(config, no_tls).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Routes => print_routes(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<HubConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(HubConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(HubConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass --config or create one of {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )
    .into())
}

async fn run_hub(config: HubConfig, no_tls: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        device_id = %config.hub.device_id,
        upstream = %config.hub.iothub_hostname,
        "Starting edgehub v{}",
        env!("CARGO_PKG_VERSION")
    );
    metrics().set_hub_state("initializing");

    let mut upstream = MqttUpstream::from_config(&config);
    if no_tls {
        upstream = upstream.without_tls();
    }

    let stop = CancellationToken::new();
    let mut hub = Hub::new(config.clone(), Arc::new(upstream))?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok());
    let health_task = health_port.map(|port| {
        let health = Arc::new(HealthServer::new(config.hub.device_id.clone(), port));
        hub.set_health_server(Arc::clone(&health));
        let cancel = stop.child_token();
        tokio::spawn(async move {
            if let Err(e) = health.start(cancel).await {
                error!("Health server error: {}", e);
            }
        })
    });

    hub.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    hub.shutdown().await;
    stop.cancel();
    if let Some(task) = health_task {
        let _ = task.await;
    }
    Ok(())
}

fn handle_config_command(config: &HubConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration is valid");
    Ok(())
}

fn print_routes(config: &HubConfig) -> Result<(), Box<dyn std::error::Error>> {
    let table = config.route_table()?;
    if table.is_empty() {
        println!("No routes configured");
        return Ok(());
    }
    for route in table.routes() {
        let endpoints: Vec<String> = route.endpoints.iter().map(ToString::to_string).collect();
        println!("{}", route.name);
        println!("  source:     {}", route.source);
        if let Some(condition) = &route.condition {
            println!("  condition:  {condition}");
        }
        println!("  endpoints:  {}", endpoints.join(", "));
    }
    Ok(())
}
