//! llm-tracelab - Recording/Replay Proxy for LLM APIs

use clap::{Parser, Subcommand};
use llm_tracelab::monitor::MonitorServer;
use llm_tracelab::proxy::ProxyServer;
use llm_tracelab::{config, upstream, NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// llm-tracelab - Recording/Replay Proxy for LLM APIs
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Transparent recording proxy for OpenAI-compatible LLM APIs")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tracelab.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Run,

    /// Validate configuration file
    Validate,

    /// Run the upstream connectivity check and exit
    Check,
}

#[tokio::main]
async fn main() -> llm_tracelab::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format);

    match cli.command {
        Some(Commands::Validate) => validate_config(&cli.config),
        Some(Commands::Check) => check_upstream(&cli.config).await,
        Some(Commands::Run) | None => run_server(&cli.config).await,
    }
}

/// Initialize logging based on CLI flags
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("llm_tracelab={}", level)));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

/// Run the proxy (and the monitor dashboard when configured)
async fn run_server(config_path: &PathBuf) -> llm_tracelab::Result<()> {
    info!("Starting {} v{}", NAME, VERSION);

    let config = Arc::new(config::load_config(config_path)?);

    // Fail fast: an unreachable upstream should stop the process before the
    // proxy starts accepting traffic.
    let models =
        upstream::check_connectivity(&config.upstream.base_url, &config.upstream.api_key).await?;
    for model in &models {
        info!(model = %model, "upstream model available");
    }

    if let Some(port) = config.monitor.port {
        let monitor = MonitorServer::new(config.debug.output_dir.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                error!("Monitor server failed: {}", e);
            }
        });
    }

    let server = ProxyServer::new(config)?;
    server.run().await
}

/// Validate configuration file
fn validate_config(config_path: &PathBuf) -> llm_tracelab::Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid.");
            println!("  Proxy port:  {}", config.server.port);
            match config.monitor.port {
                Some(port) => println!("  Monitor:     port {}", port),
                None => println!("  Monitor:     disabled"),
            }
            println!("  Upstream:    {}", config.upstream.base_url);
            println!("  Output dir:  {}", config.debug.output_dir.display());
            println!(
                "  Chaos:       {} ({} rules)",
                if config.chaos.enabled { "enabled" } else { "disabled" },
                config.chaos.rules.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration is invalid: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run the upstream connectivity check and exit
async fn check_upstream(config_path: &PathBuf) -> llm_tracelab::Result<()> {
    let config = config::load_config(config_path)?;
    let models =
        upstream::check_connectivity(&config.upstream.base_url, &config.upstream.api_key).await?;

    println!("Upstream reachable: {}", config.upstream.base_url);
    if models.is_empty() {
        println!("(no models returned in 'data' field)");
    }
    for model in models {
        println!("- {}", model);
    }
    Ok(())
}
