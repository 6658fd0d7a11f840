//! Voice Ferry Core command-line entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use voice_ferry_core::{
    config::GatewayConfig,
    core::{Gateway, GatewayEvent},
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "voice-ferry-core")]
#[command(about = "A SIP back-to-back user agent bridging call legs through RTPEngine")]
#[command(version = voice_ferry_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and block until shutdown
    Start,
    /// Validate configuration without starting the gateway
    ValidateConfig,
    /// Print the default configuration as TOML
    GenerateConfig {
        /// Output file path; prints to stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli).await?;

    setup_logging(&config.logging)?;

    info!("Starting {} v{}", voice_ferry_core::NAME, voice_ferry_core::VERSION);
    info!("{}", voice_ferry_core::DESCRIPTION);

    match &cli.command {
        Some(Commands::Start) | None => run_gateway(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config).await,
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()).await,
    }
}

async fn load_configuration(cli: &Cli) -> Result<GatewayConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path.display());
        GatewayConfig::load_from_file(config_path)?
    } else {
        info!("No configuration file specified, trying environment variables");
        match GatewayConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => {
                info!("No environment configuration found, using defaults");
                GatewayConfig::default_config()
            }
        }
    };

    config.validate()?;
    info!("Configuration loaded and validated successfully");

    Ok(config)
}

async fn run_gateway(config: GatewayConfig) -> Result<()> {
    info!("Initializing gateway");

    let mut gateway = Gateway::new(config)?;

    let mut event_rx = gateway
        .take_event_receiver()
        .ok_or_else(|| voice_ferry_core::Error::internal("failed to get event receiver"))?;

    gateway.start().await?;

    let gateway = Arc::new(tokio::sync::Mutex::new(gateway));
    let gateway_shutdown = Arc::clone(&gateway);

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_gateway_event(event).await;
        }
    });

    let shutdown_task = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully");
                let mut gateway = gateway_shutdown.lock().await;
                if let Err(e) = gateway.stop().await {
                    error!("Error during shutdown: {}", e);
                }
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    tokio::select! {
        _ = event_task => {
            info!("Event handling completed");
        }
        _ = shutdown_task => {
            info!("Shutdown signal received");
        }
    }

    let mut gateway = gateway.lock().await;
    if gateway.is_running().await {
        gateway.stop().await?;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

async fn handle_gateway_event(event: GatewayEvent) {
    match event {
        GatewayEvent::Started => info!("gateway started"),
        GatewayEvent::Stopped => info!("gateway stopped"),
        GatewayEvent::CallStarted { call_id } => info!("call started: {}", call_id),
        GatewayEvent::CallEnded { call_id } => info!("call ended: {}", call_id),
        GatewayEvent::Error { message } => error!("gateway error: {}", message),
    }
}

async fn validate_configuration(config: &GatewayConfig) -> Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  SIP UDP port: {}", config.sip.udp_port);
    println!("  SIP TCP port: {:?}", config.sip.tcp_port);
    println!("  RTPEngine instances: {}", config.rtpengine.instances.len());
    println!("  Session limit enabled: {}", config.session_limit.enabled);
    println!("  Routing rules: {}", config.routing.rules.len());

    Ok(())
}

async fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = GatewayConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| voice_ferry_core::Error::internal(format!("failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_generation() {
        let result = generate_default_config(None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_config_validation() {
        let config = GatewayConfig::default_config();
        let result = validate_configuration(&config).await;
        assert!(result.is_ok());
    }
}
